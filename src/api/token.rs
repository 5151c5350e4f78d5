// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
    Form, Json,
};
use base64ct::{Base64, Encoding};
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::form_urlencoded;
use utoipa::ToSchema;

use crate::{
    auth::{
        clients::{
            GRANT_AUTHORIZATION_CODE, GRANT_CLIENT_CREDENTIALS, GRANT_PASSWORD,
            GRANT_REFRESH_TOKEN,
        },
        exchange::AUTH_METHOD_PASSWORD,
        ExchangeError, OAuthError, TokenSet,
    },
    state::AppState,
};

/// Token request form (`application/x-www-form-urlencoded`).
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct TokenRequest {
    pub grant_type: Option<String>,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub code_verifier: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub scope: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub refresh_token: Option<String>,
}

/// Successful token response.
#[derive(Debug, Serialize, ToSchema)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl From<TokenSet> for TokenResponse {
    fn from(tokens: TokenSet) -> Self {
        Self {
            access_token: tokens.access_token,
            token_type: "Bearer".to_string(),
            expires_in: tokens.expires_in,
            id_token: tokens.id_token,
            scope: tokens.scope,
        }
    }
}

impl IntoResponse for TokenResponse {
    fn into_response(self) -> Response {
        let mut response = Json(self).into_response();
        let headers = response.headers_mut();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
        response
    }
}

/// Client credentials from either HTTP Basic or the form body.
#[derive(Debug, Default)]
struct ClientCredentials {
    client_id: Option<String>,
    client_secret: Option<String>,
}

/// Parse `Authorization: Basic`; id and secret are form-encoded inside it.
fn basic_credentials(headers: &HeaderMap) -> Result<Option<(String, String)>, OAuthError> {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Ok(None);
    };
    let malformed = || OAuthError::invalid_client("Malformed Basic authorization header");

    let value = value.to_str().map_err(|_| malformed())?;
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return Err(malformed());
    };
    let decoded = Base64::decode_vec(encoded.trim()).map_err(|_| malformed())?;
    let decoded = String::from_utf8(decoded).map_err(|_| malformed())?;
    let (id, secret) = decoded.split_once(':').ok_or_else(malformed)?;

    let unescape = |s: &str| -> String {
        form_urlencoded::parse(format!("v={s}").as_bytes())
            .next()
            .map(|(_, v)| v.into_owned())
            .unwrap_or_default()
    };
    Ok(Some((unescape(id), unescape(secret))))
}

fn client_credentials(
    headers: &HeaderMap,
    form: &TokenRequest,
) -> Result<ClientCredentials, OAuthError> {
    match basic_credentials(headers)? {
        Some((id, secret)) => {
            if form.client_id.as_deref().is_some_and(|form_id| form_id != id) {
                return Err(OAuthError::invalid_request(
                    "client_id does not match the Authorization header",
                ));
            }
            Ok(ClientCredentials {
                client_id: Some(id),
                client_secret: Some(secret),
            })
        }
        None => Ok(ClientCredentials {
            client_id: form.client_id.clone().filter(|id| !id.is_empty()),
            client_secret: form.client_secret.clone(),
        }),
    }
}

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str, OAuthError> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| OAuthError::invalid_request(format!("{name} is required")))
}

fn rejected(grant_type: &str, err: ExchangeError) -> OAuthError {
    warn!(grant_type = %grant_type, error = %err, "Token request rejected");
    err.into()
}

/// Token endpoint.
///
/// Supports the authorization code, client credentials and password grants.
/// Refresh tokens are not issued, so that grant answers 501.
#[utoipa::path(
    post,
    path = "/oauth2/token",
    request_body(content = TokenRequest, content_type = "application/x-www-form-urlencoded"),
    tag = "OAuth2",
    responses(
        (status = 200, description = "Tokens issued", body = TokenResponse),
        (status = 400, description = "Invalid request, client or grant", body = crate::auth::error::OAuthErrorBody),
        (status = 401, description = "Invalid credentials", body = crate::auth::error::OAuthErrorBody),
        (status = 501, description = "Grant type not implemented", body = crate::auth::error::OAuthErrorBody)
    )
)]
pub async fn token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<TokenRequest>,
) -> Result<TokenResponse, OAuthError> {
    let grant_type = required(&form.grant_type, "grant_type")?;
    let exchanger = state.engine.exchanger();
    let scope = form.scope.as_deref().unwrap_or_default();

    let tokens = match grant_type {
        GRANT_AUTHORIZATION_CODE => {
            let code = required(&form.code, "code")?;
            let redirect_uri = required(&form.redirect_uri, "redirect_uri")?;
            let credentials = client_credentials(&headers, &form)?;
            let client_id = required(&credentials.client_id, "client_id")?;

            exchanger
                .authenticate_client(client_id, credentials.client_secret.as_deref())
                .map_err(|err| rejected(grant_type, err))?;
            exchanger
                .redeem_authorization_code(
                    code,
                    client_id,
                    redirect_uri,
                    form.code_verifier.as_deref(),
                )
                .await
        }
        GRANT_CLIENT_CREDENTIALS => {
            let credentials = client_credentials(&headers, &form)?;
            let client_id = required(&credentials.client_id, "client_id")?;
            exchanger
                .login_client(
                    client_id,
                    credentials.client_secret.as_deref().unwrap_or_default(),
                    scope,
                )
                .await
        }
        GRANT_PASSWORD => {
            let username = required(&form.username, "username")?;
            let password = required(&form.password, "password")?;
            let credentials = client_credentials(&headers, &form)?;
            if let Some(client_id) = credentials.client_id.as_deref() {
                exchanger
                    .authenticate_client(client_id, credentials.client_secret.as_deref())
                    .map_err(|err| rejected(grant_type, err))?;
            }
            exchanger
                .login_local(
                    username,
                    password,
                    scope,
                    credentials.client_id.as_deref(),
                    AUTH_METHOD_PASSWORD,
                )
                .await
        }
        GRANT_REFRESH_TOKEN => {
            return Err(OAuthError::not_implemented(
                "refresh_token grant is not supported",
            ))
        }
        other => {
            return Err(OAuthError::unsupported_grant_type(format!(
                "grant_type {other} is not supported"
            )))
        }
    };

    tokens
        .map(TokenResponse::from)
        .map_err(|err| rejected(grant_type, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::code::AuthorizationCodeClaims;
    use crate::auth::pkce;
    use crate::testutil::{
        self, CLIENT_SECRET, CONFIDENTIAL_CLIENT, PASSWORD, PUBLIC_CLIENT, REDIRECT_URI, SUBJECT,
        USERNAME,
    };
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        Router,
    };
    use base64::Engine as _;
    use serde_json::Value;
    use tower::ServiceExt;

    async fn post(app: Router, body: &str, basic: Option<(&str, &str)>) -> (StatusCode, HeaderMap, Value) {
        let mut request = Request::builder()
            .method("POST")
            .uri("/oauth2/token")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
        if let Some((id, secret)) = basic {
            let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{id}:{secret}"));
            request = request.header(header::AUTHORIZATION, format!("Basic {encoded}"));
        }
        let response = app
            .oneshot(request.body(Body::from(body.to_string())).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn client_credentials_with_basic_auth() {
        let app = crate::api::router(testutil::app_state());
        let (status, headers, body) = post(
            app,
            "grant_type=client_credentials",
            Some((CONFIDENTIAL_CLIENT, CLIENT_SECRET)),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CACHE_CONTROL], "no-store");
        assert_eq!(body["token_type"], "Bearer");
        assert_eq!(body["scope"], "volumes::all");
        assert!(body.get("id_token").is_none());
    }

    #[tokio::test]
    async fn client_credentials_rejects_bad_secret() {
        let app = crate::api::router(testutil::app_state());
        let (status, headers, body) = post(
            app.clone(),
            "grant_type=client_credentials&client_id=builder&client_secret=wrong",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_client");
        assert_eq!(headers[header::CACHE_CONTROL], "no-store");

        let (_, _, body) = post(
            app,
            "grant_type=client_credentials&client_id=builder&client_secret=s3cret",
            Some((CONFIDENTIAL_CLIENT, CLIENT_SECRET)),
        )
        .await;
        assert_eq!(body["access_token"].as_str().map(str::is_empty), Some(false));
    }

    #[tokio::test]
    async fn password_grant_issues_identity_token_for_client() {
        let state = testutil::app_state();
        let app = crate::api::router(state.clone());
        let (status, _, body) = post(
            app,
            &format!(
                "grant_type=password&username={USERNAME}&password={PASSWORD}\
                 &client_id={PUBLIC_CLIENT}&scope=openid%20pages%3A%3Aread"
            ),
            None,
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["scope"], "openid pages::read");
        let id_token = body["id_token"].as_str().unwrap();
        let claims = testutil::verifier(state.engine.keys())
            .verify_for(id_token, PUBLIC_CLIENT)
            .unwrap();
        assert_eq!(claims.subject(), Some(SUBJECT));
    }

    #[tokio::test]
    async fn password_grant_wrong_password_is_unauthorized() {
        let app = crate::api::router(testutil::app_state());
        let (status, _, body) = post(
            app,
            &format!("grant_type=password&username={USERNAME}&password=nope"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "invalid_grant");
    }

    #[tokio::test]
    async fn authorization_code_is_single_use() {
        let state = testutil::app_state();
        let verifier = "a".repeat(43);
        let code = state
            .engine
            .exchanger()
            .create_authorization_code(AuthorizationCodeClaims {
                subject: SUBJECT.to_string(),
                client_id: PUBLIC_CLIENT.to_string(),
                scope: "openid".to_string(),
                redirect_uri: REDIRECT_URI.to_string(),
                code_challenge: Some(pkce::challenge(&verifier, pkce::METHOD_S256).unwrap()),
                code_challenge_method: Some(pkce::METHOD_S256.to_string()),
                auth_method: AUTH_METHOD_PASSWORD.to_string(),
                exp: 0,
            })
            .unwrap();
        let body = form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", "authorization_code")
            .append_pair("code", &code)
            .append_pair("redirect_uri", REDIRECT_URI)
            .append_pair("client_id", PUBLIC_CLIENT)
            .append_pair("code_verifier", &verifier)
            .finish();

        let app = crate::api::router(state);
        let (status, _, first) = post(app.clone(), &body, None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(first["id_token"].is_string());

        let (status, _, second) = post(app, &body, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(second["error"], "invalid_grant");
    }

    #[tokio::test]
    async fn unsupported_and_unimplemented_grants() {
        let app = crate::api::router(testutil::app_state());

        let (status, _, body) = post(app.clone(), "grant_type=refresh_token&refresh_token=x", None).await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
        assert_eq!(body["error"], "unsupported_grant_type");

        let (status, _, body) = post(app.clone(), "grant_type=implicit", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "unsupported_grant_type");

        let (status, _, body) = post(app, "scope=openid", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_request");
    }

    #[test]
    fn basic_credentials_are_form_decoded() {
        let mut headers = HeaderMap::new();
        let encoded = Base64::encode_string(b"my%20client:p%3Ass");
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {encoded}")).unwrap(),
        );
        let (id, secret) = basic_credentials(&headers).unwrap().unwrap();
        assert_eq!(id, "my client");
        assert_eq!(secret, "p:ss");

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic !!"));
        assert!(basic_credentials(&headers).is_err());
    }
}
