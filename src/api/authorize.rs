// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    extract::{OriginalUri, Query, State},
    response::Response,
};
use serde::Deserialize;
use tracing::{info, warn};
use url::{form_urlencoded, Url};
use utoipa::IntoParams;

use super::found;
use crate::{
    auth::{code::AuthorizationCodeClaims, OAuthError, OptionalAuth},
    state::AppState,
};

/// Authorize request parameters.
///
/// All optional here so missing ones produce an OAuth error body instead of
/// a query rejection.
#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct AuthorizeQuery {
    pub client_id: Option<String>,
    pub response_type: Option<String>,
    pub redirect_uri: Option<String>,
    pub scope: Option<String>,
    pub state: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
}

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str, OAuthError> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| OAuthError::invalid_request(format!("{name} is required")))
}

/// Authorization endpoint (code flow).
///
/// Request errors are reported directly and never redirect, since the
/// redirect URI has not been validated at that point.
#[utoipa::path(
    get,
    path = "/oauth2/authorize",
    params(AuthorizeQuery),
    tag = "OAuth2",
    responses(
        (status = 302, description = "Redirect to the client with a code, or to the login page"),
        (status = 400, description = "Invalid request", body = crate::auth::error::OAuthErrorBody),
        (status = 501, description = "Authentication not configured", body = crate::auth::error::OAuthErrorBody)
    )
)]
pub async fn authorize(
    State(state): State<AppState>,
    OriginalUri(original): OriginalUri,
    OptionalAuth(context): OptionalAuth,
    Query(query): Query<AuthorizeQuery>,
) -> Result<Response, OAuthError> {
    let client_id = required(&query.client_id, "client_id")?;
    let redirect_uri = required(&query.redirect_uri, "redirect_uri")?;
    match query.response_type.as_deref() {
        Some("code") => {}
        Some(other) => {
            return Err(OAuthError::unsupported_response_type(format!(
                "response_type {other} is not supported"
            )))
        }
        None => return Err(OAuthError::invalid_request("response_type is required")),
    }
    let scope = query.scope.as_deref().unwrap_or_default();

    let exchanger = state.engine.exchanger();
    if let Err(err) = exchanger.validate_authorization_request(
        client_id,
        redirect_uri,
        scope,
        query.code_challenge.as_deref(),
        query.code_challenge_method.as_deref(),
    ) {
        warn!(error = %err, client_id = %client_id, "Rejected authorize request");
        return Err(err.into());
    }

    let Some(context) = context else {
        let target = original
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("return", target)
            .finish();
        return Ok(found(&format!("{}?{query}", state.settings.login_path)));
    };

    let claims = AuthorizationCodeClaims {
        subject: context.subject.clone(),
        client_id: client_id.to_string(),
        scope: scope.to_string(),
        redirect_uri: redirect_uri.to_string(),
        code_challenge: query.code_challenge.clone().filter(|c| !c.is_empty()),
        code_challenge_method: query.code_challenge_method.clone(),
        auth_method: context.auth_method().unwrap_or_default().to_string(),
        exp: 0,
    };
    let code = exchanger.create_authorization_code(claims).map_err(|err| {
        warn!(error = %err, "Failed to create authorization code");
        OAuthError::from(err)
    })?;

    let mut target = Url::parse(redirect_uri)
        .map_err(|_| OAuthError::invalid_request("redirect_uri is not a valid URL"))?;
    {
        let mut pairs = target.query_pairs_mut();
        pairs.append_pair("code", &code);
        if let Some(client_state) = query.state.as_deref().filter(|s| !s.is_empty()) {
            pairs.append_pair("state", client_state);
        }
    }

    info!(client_id = %client_id, subject = %context.subject, "Issued authorization code");
    Ok(found(target.as_str()))
}
