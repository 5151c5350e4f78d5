// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    http::{header::LOCATION, StatusCode},
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::{
    auth::{
        claims::{AuthContext, TokenSource},
        error::{AuthErrorBody, OAuthErrorBody},
        jwks::JwksDocument,
        keys::PublicJwk,
        middleware::auth_middleware,
    },
    config::OIDC_CALLBACK_PATH,
    state::AppState,
};

pub mod authorize;
pub mod health;
pub mod session;
pub mod token;
pub mod wellknown;

/// 302 to `location`.
pub(crate) fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(LOCATION, location.to_string())]).into_response()
}

pub fn router(state: AppState) -> Router {
    // Routes behind the session middleware
    let authenticated = Router::new()
        .route("/oauth2/authorize", get(authorize::authorize))
        .route("/auth/login", post(session::login))
        .route("/auth/logout", post(session::logout))
        .route("/auth/oidc/login", get(session::oidc_login))
        .route(OIDC_CALLBACK_PATH, get(session::oidc_callback))
        .route("/auth/userinfo", get(session::userinfo))
        .route("/.well-known/jwks.json", get(wellknown::jwks))
        .route(
            "/.well-known/openid-configuration",
            get(wellknown::openid_configuration),
        )
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .layer(from_fn_with_state(state.clone(), auth_middleware));

    // Clients authenticate here with HTTP Basic, not a bearer token
    let token = Router::new().route("/oauth2/token", post(token::token));

    Router::new()
        .merge(authenticated)
        .merge(token)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        health::liveness,
        health::readiness,
        wellknown::jwks,
        wellknown::openid_configuration,
        authorize::authorize,
        token::token,
        session::login,
        session::logout,
        session::oidc_login,
        session::oidc_callback,
        session::userinfo
    ),
    components(
        schemas(
            health::ReadyResponse,
            health::HealthChecks,
            health::HealthResponse,
            wellknown::DiscoveryDocument,
            JwksDocument,
            PublicJwk,
            token::TokenRequest,
            token::TokenResponse,
            session::LoginForm,
            AuthContext,
            TokenSource,
            AuthErrorBody,
            OAuthErrorBody
        )
    ),
    tags(
        (name = "Health", description = "Liveness and readiness"),
        (name = "Discovery", description = "JWKS and OpenID provider metadata"),
        (name = "OAuth2", description = "Authorization code, client credentials and password grants"),
        (name = "Session", description = "Browser login sessions")
    )
)]
struct ApiDoc;
