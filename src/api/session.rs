// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Browser session routes: local login, upstream OIDC login, logout and
//! userinfo.

use axum::{
    extract::{Query, State},
    http::{header::SET_COOKIE, HeaderMap, Uri},
    response::{AppendHeaders, IntoResponse, Redirect, Response},
    Form, Json,
};
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tracing::{info, warn};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use super::found;
use crate::{
    auth::{
        cookie::{
            build_clear_cookie, build_set_cookie, is_secure_request, read_cookie,
            sanitize_return_path, LoginState, OIDC_STATE_COOKIE, OIDC_STATE_MAX_AGE,
        },
        exchange::{AUTH_METHOD_PASSWORD, SESSION_SCOPE},
        Auth, ClaimSet, TokenSet,
    },
    error::ApiError,
    state::AppState,
};

#[derive(Debug, Deserialize, ToSchema)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
    #[serde(default, rename = "return")]
    pub return_to: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ReturnQuery {
    #[serde(default, rename = "return")]
    pub return_to: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

fn secure(state: &AppState, headers: &HeaderMap, uri: &Uri) -> bool {
    is_secure_request(headers, uri, state.tls_enabled())
}

fn session_cookie(state: &AppState, tokens: &TokenSet, secure: bool) -> String {
    build_set_cookie(
        &state.settings.cookie_name,
        &tokens.access_token,
        tokens.expires_in,
        secure,
    )
}

/// Local username/password login.
#[utoipa::path(
    post,
    path = "/auth/login",
    request_body(content = LoginForm, content_type = "application/x-www-form-urlencoded"),
    tag = "Session",
    responses(
        (status = 303, description = "Session cookie set, redirect to the return path"),
        (status = 401, description = "Invalid credentials"),
        (status = 501, description = "Local login not configured")
    )
)]
pub async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
    Form(form): Form<LoginForm>,
) -> Result<Response, ApiError> {
    let tokens = state
        .engine
        .exchanger()
        .login_local(
            &form.username,
            &form.password,
            SESSION_SCOPE,
            None,
            AUTH_METHOD_PASSWORD,
        )
        .await
        .map_err(|err| {
            warn!(error = %err, "Local login rejected");
            ApiError::from(err)
        })?;

    let cookie = session_cookie(&state, &tokens, secure(&state, &headers, &uri));
    let target = sanitize_return_path(form.return_to.as_deref());
    Ok((AppendHeaders([(SET_COOKIE, cookie)]), Redirect::to(&target)).into_response())
}

/// Start the upstream OIDC login.
#[utoipa::path(
    get,
    path = "/auth/oidc/login",
    params(ReturnQuery),
    tag = "Session",
    responses(
        (status = 302, description = "Redirect to the identity provider"),
        (status = 501, description = "OIDC not configured")
    )
)]
pub async fn oidc_login(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
    Query(query): Query<ReturnQuery>,
) -> Result<Response, ApiError> {
    let login_state = LoginState {
        state: Uuid::new_v4().simple().to_string(),
        return_to: sanitize_return_path(query.return_to.as_deref()),
    };

    let Some(url) = state.engine.exchanger().auth_code_url(&login_state.state)? else {
        return Err(ApiError::not_implemented("OIDC login is not configured"));
    };
    let signed = state.engine.state_signer().sign(&login_state).map_err(|err| {
        warn!(error = %err, "Failed to sign OIDC state");
        ApiError::internal("Internal server error")
    })?;

    let cookie = build_set_cookie(
        OIDC_STATE_COOKIE,
        &signed,
        OIDC_STATE_MAX_AGE,
        secure(&state, &headers, &uri),
    );
    Ok((AppendHeaders([(SET_COOKIE, cookie)]), found(&url)).into_response())
}

/// Provider callback: check the state, exchange the code, set the session.
#[utoipa::path(
    get,
    path = "/auth/oidc/callback",
    params(CallbackQuery),
    tag = "Session",
    responses(
        (status = 303, description = "Session cookie set, redirect to the saved return path"),
        (status = 400, description = "Missing or mismatched state"),
        (status = 401, description = "Identity provider rejected the login")
    )
)]
pub async fn oidc_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
    Query(query): Query<CallbackQuery>,
) -> Result<Response, ApiError> {
    if let Some(error) = query.error.as_deref() {
        warn!(error = %error, "Identity provider returned an error");
        return Err(ApiError::unauthorized("Identity provider rejected the login"));
    }

    let saved = read_cookie(&headers, OIDC_STATE_COOKIE)
        .and_then(|value| state.engine.state_signer().verify(&value))
        .ok_or_else(|| ApiError::bad_request("Login state is missing or invalid"))?;
    let presented = query.state.as_deref().unwrap_or_default();
    if !bool::from(saved.state.as_bytes().ct_eq(presented.as_bytes())) {
        return Err(ApiError::bad_request("Login state does not match"));
    }
    let code = query
        .code
        .as_deref()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| ApiError::bad_request("code is required"))?;

    let exchanger = state.engine.exchanger();
    let tokens = async {
        let raw = exchanger.exchange_code(code).await?;
        exchanger.exchange_token(&raw).await
    }
    .await
    .map_err(|err| {
        warn!(error = %err, "OIDC login failed");
        ApiError::from(err)
    })?;

    let secure = secure(&state, &headers, &uri);
    info!(return_to = %saved.return_to, "OIDC login complete");
    Ok((
        AppendHeaders([
            (SET_COOKIE, session_cookie(&state, &tokens, secure)),
            (SET_COOKIE, build_clear_cookie(OIDC_STATE_COOKIE, secure)),
        ]),
        Redirect::to(&sanitize_return_path(Some(&saved.return_to))),
    )
        .into_response())
}

/// Clear the session cookie.
#[utoipa::path(
    post,
    path = "/auth/logout",
    tag = "Session",
    responses((status = 303, description = "Session cleared, redirect to /"))
)]
pub async fn logout(State(state): State<AppState>, headers: HeaderMap, uri: Uri) -> Response {
    let cookie = build_clear_cookie(&state.settings.cookie_name, secure(&state, &headers, &uri));
    (AppendHeaders([(SET_COOKIE, cookie)]), Redirect::to("/")).into_response()
}

/// Claims of the authenticated caller.
#[utoipa::path(
    get,
    path = "/auth/userinfo",
    tag = "Session",
    responses(
        (status = 200, description = "Verified claims"),
        (status = 401, description = "Not authenticated", body = crate::auth::error::AuthErrorBody)
    )
)]
pub async fn userinfo(Auth(context): Auth) -> Json<ClaimSet> {
    Json(context.claims)
}

#[cfg(test)]
mod tests {
    use crate::auth::oidc::OidcProvider;
    use crate::auth::TokenSource;
    use crate::testutil::{self, MockOidc, PASSWORD, SUBJECT, USERNAME};
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
        response::Response,
        Router,
    };
    use serde_json::Value;
    use tower::ServiceExt;
    use url::Url;

    fn set_cookies(response: &Response) -> Vec<String> {
        response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect()
    }

    fn cookie_value(set_cookie: &str) -> &str {
        let pair = set_cookie.split(';').next().unwrap();
        pair.split_once('=').unwrap().1
    }

    async fn login(app: Router, body: &str) -> Response {
        app.oneshot(
            Request::builder()
                .method("POST")
                .uri("/auth/login")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap()
    }

    async fn get_with_cookie(app: Router, uri: &str, cookie: &str) -> Response {
        app.oneshot(
            Request::builder()
                .uri(uri)
                .header(header::COOKIE, cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn local_login_sets_session_cookie() {
        let state = testutil::app_state();
        let app = crate::api::router(state.clone());

        let response = login(
            app.clone(),
            &format!("username={USERNAME}&password={PASSWORD}&return=%2Fdashboard"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/dashboard");

        let cookies = set_cookies(&response);
        assert_eq!(cookies.len(), 1);
        assert!(cookies[0].starts_with("auth_token="));
        assert!(cookies[0].contains("HttpOnly"));
        assert!(cookies[0].contains("Max-Age=3600"));

        let token = cookie_value(&cookies[0]);
        let context = state.engine.authenticate(token, TokenSource::Cookie).unwrap();
        assert_eq!(context.subject, SUBJECT);
        assert_eq!(context.auth_method(), Some("password"));

        let response = get_with_cookie(app, "/auth/userinfo", &format!("auth_token={token}")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["sub"], SUBJECT);
        assert_eq!(body["email"], "joe@example.com");
    }

    #[tokio::test]
    async fn login_rejects_bad_password_and_foreign_return() {
        let app = crate::api::router(testutil::app_state());

        let response = login(app.clone(), &format!("username={USERNAME}&password=nope")).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().get(header::SET_COOKIE).is_none());

        let response = login(
            app,
            &format!("username={USERNAME}&password={PASSWORD}&return=%2F%2Fevil.com"),
        )
        .await;
        assert_eq!(response.headers()[header::LOCATION], "/");
    }

    #[tokio::test]
    async fn userinfo_requires_authentication() {
        let app = crate::api::router(testutil::app_state());
        let response = app
            .oneshot(Request::builder().uri("/auth/userinfo").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn logout_clears_cookie() {
        let app = crate::api::router(testutil::app_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/auth/logout")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/");
        assert!(set_cookies(&response)[0].contains("Max-Age=0"));
    }

    #[tokio::test]
    async fn oidc_login_unconfigured_is_not_implemented() {
        let app = crate::api::router(testutil::app_state());
        let response = app
            .oneshot(Request::builder().uri("/auth/oidc/login").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn oidc_round_trip() {
        let mock = MockOidc::start().await;
        let provider = OidcProvider::discover(mock.settings()).await.unwrap();
        let state = testutil::app_state_with_oidc(provider);
        let app = crate::api::router(state.clone());

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/auth/oidc/login?return=%2Freports")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        let location = Url::parse(response.headers()[header::LOCATION].to_str().unwrap()).unwrap();
        assert!(location.as_str().starts_with(&mock.issuer));
        let oidc_state = location
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .unwrap();
        let state_cookie = set_cookies(&response)[0].clone();
        assert!(state_cookie.starts_with("oidc_state="));
        let state_cookie = format!("oidc_state={}", cookie_value(&state_cookie));

        let response = get_with_cookie(
            app.clone(),
            "/auth/oidc/callback?code=wrong-state&state=nope",
            &state_cookie,
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = get_with_cookie(
            app,
            &format!(
                "/auth/oidc/callback?code={}&state={oidc_state}",
                MockOidc::GOOD_CODE
            ),
            &state_cookie,
        )
        .await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/reports");

        let cookies = set_cookies(&response);
        assert_eq!(cookies.len(), 2);
        assert!(cookies[1].starts_with("oidc_state=;"));
        let context = state
            .engine
            .authenticate(cookie_value(&cookies[0]), TokenSource::Cookie)
            .unwrap();
        assert_eq!(context.subject, MockOidc::SUBJECT);
        assert_eq!(context.auth_method(), Some("oidc"));
        let roles = context.roles();
        assert!(roles.contains(&"viewer".to_string()));
        assert!(roles.contains(&"auditor".to_string()));
    }
}
