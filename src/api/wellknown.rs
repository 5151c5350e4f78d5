// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! JWKS and OpenID discovery publishers.

use axum::{extract::State, Json};
use serde::Serialize;
use utoipa::ToSchema;

use crate::auth::clients::{
    GRANT_AUTHORIZATION_CODE, GRANT_CLIENT_CREDENTIALS, GRANT_PASSWORD, IDENTITY_SCOPES,
};
use crate::auth::jwks::JwksDocument;
use crate::state::AppState;

/// OpenID provider metadata.
#[derive(Debug, Serialize, ToSchema)]
pub struct DiscoveryDocument {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub jwks_uri: String,
    pub userinfo_endpoint: String,
    pub response_types_supported: Vec<String>,
    pub subject_types_supported: Vec<String>,
    pub id_token_signing_alg_values_supported: Vec<String>,
    pub scopes_supported: Vec<String>,
    pub grant_types_supported: Vec<String>,
    pub token_endpoint_auth_methods_supported: Vec<String>,
    pub code_challenge_methods_supported: Vec<String>,
}

impl DiscoveryDocument {
    pub fn new(issuer: &str) -> Self {
        let base = issuer.trim_end_matches('/');
        let strings = |values: &[&str]| values.iter().map(|v| v.to_string()).collect();

        Self {
            issuer: issuer.to_string(),
            authorization_endpoint: format!("{base}/oauth2/authorize"),
            token_endpoint: format!("{base}/oauth2/token"),
            jwks_uri: format!("{base}/.well-known/jwks.json"),
            userinfo_endpoint: format!("{base}/auth/userinfo"),
            response_types_supported: strings(&["code"]),
            subject_types_supported: strings(&["public"]),
            id_token_signing_alg_values_supported: strings(&["RS256", "ES256"]),
            scopes_supported: strings(IDENTITY_SCOPES),
            grant_types_supported: strings(&[
                GRANT_AUTHORIZATION_CODE,
                GRANT_CLIENT_CREDENTIALS,
                GRANT_PASSWORD,
            ]),
            token_endpoint_auth_methods_supported: strings(&[
                "client_secret_basic",
                "client_secret_post",
                "none",
            ]),
            code_challenge_methods_supported: strings(&["S256", "plain"]),
        }
    }
}

#[utoipa::path(
    get,
    path = "/.well-known/jwks.json",
    tag = "Discovery",
    responses((status = 200, description = "Public signing keys", body = JwksDocument))
)]
pub async fn jwks(State(state): State<AppState>) -> Json<JwksDocument> {
    Json(state.engine.jwks())
}

#[utoipa::path(
    get,
    path = "/.well-known/openid-configuration",
    tag = "Discovery",
    responses((status = 200, description = "Provider metadata", body = DiscoveryDocument))
)]
pub async fn openid_configuration(State(state): State<AppState>) -> Json<DiscoveryDocument> {
    Json(DiscoveryDocument::new(state.engine.issuer()))
}
