// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Shared test fixtures: a fully wired engine and an in-process OIDC provider.

use std::sync::{Arc, OnceLock};

use axum::{
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use base64::Engine as _;
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, Header};
use p256::pkcs8::{EncodePrivateKey, LineEnding};
use rand::rngs::OsRng;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::clients::{AuthClient, ClientRegistry};
use crate::auth::code::AuthorizationCodeCodec;
use crate::auth::cookie::StateSigner;
use crate::auth::jwks::JwksDocument;
use crate::auth::keys::{KeyPair, KeyPairs, PrivateKey};
use crate::auth::oidc::{OidcProvider, OidcSettings};
use crate::auth::provider::{hash_password, StaticScopeProvider};
use crate::auth::signer::{Signer, TokenSettings};
use crate::auth::{AuthEngine, Exchanger, TokenVerifier};
use crate::config::Settings;
use crate::state::AppState;

pub const USERNAME: &str = "joe";
pub const PASSWORD: &str = "correct";
pub const SUBJECT: &str = "user_joe";

pub const PUBLIC_CLIENT: &str = "web";
pub const CONFIDENTIAL_CLIENT: &str = "builder";
pub const CLIENT_SECRET: &str = "s3cret";
pub const REDIRECT_URI: &str = "http://localhost/cb";

const CODE_SECRET: &[u8] = b"test authorization code secret";

pub const CLIENTS_JSON: &str = r#"[
  {
    "client_id": "web",
    "public": true,
    "redirect_uris": ["http://localhost/cb"],
    "allowed_grant_types": ["authorization_code", "password"],
    "allowed_scopes": ["pages::read"]
  },
  {
    "client_id": "builder",
    "client_secret": "s3cret",
    "redirect_uris": ["http://localhost/cb"],
    "allowed_grant_types": ["client_credentials", "authorization_code", "password"],
    "allowed_scopes": ["volumes::all"]
  }
]"#;

/// Identity store document: `joe`, plus a local record for the mock
/// provider's user carrying extra roles.
pub fn identities_json() -> String {
    static DOCUMENT: OnceLock<String> = OnceLock::new();
    DOCUMENT
        .get_or_init(|| {
            let hash = hash_password(PASSWORD).unwrap();
            json!({
                "users": [
                    {
                        "username": USERNAME,
                        "subject": SUBJECT,
                        "password_hash": hash,
                        "email": "joe@example.com",
                        "profile": {"name": "Joe"},
                        "roles": ["admin"],
                        "entitlements": ["pages::read"]
                    },
                    {
                        "username": "upstream",
                        "subject": MockOidc::SUBJECT,
                        "password_hash": hash,
                        "roles": ["auditor"]
                    }
                ]
            })
            .to_string()
        })
        .clone()
}

fn provider() -> Arc<StaticScopeProvider> {
    static PROVIDER: OnceLock<Arc<StaticScopeProvider>> = OnceLock::new();
    PROVIDER
        .get_or_init(|| Arc::new(StaticScopeProvider::from_json(&identities_json()).unwrap()))
        .clone()
}

fn clients() -> ClientRegistry {
    let clients: Vec<AuthClient> = serde_json::from_str(CLIENTS_JSON).unwrap();
    ClientRegistry::new(clients).unwrap()
}

/// PKCS#8 PEM of a fresh P-256 key.
pub fn p256_pem() -> String {
    p256::SecretKey::random(&mut OsRng)
        .to_pkcs8_pem(LineEnding::LF)
        .unwrap()
        .to_string()
}

fn key(kid: &str) -> KeyPair {
    KeyPair::new(kid, PrivateKey::Ecdsa(p256::SecretKey::random(&mut OsRng)), true).unwrap()
}

/// A fresh single-key set; every call yields different key material.
pub fn keys() -> KeyPairs {
    KeyPairs::new(vec![key("test-key")])
}

/// Settings with every variable unset.
pub fn settings() -> Settings {
    Settings::from_lookup(|_| None).unwrap()
}

pub fn token_settings() -> TokenSettings {
    settings().token_settings()
}

pub fn signer(keys: &KeyPairs) -> Signer {
    Signer::new(keys.clone(), token_settings(), None)
}

pub fn verifier(keys: &KeyPairs) -> TokenVerifier {
    TokenVerifier::new(keys.clone(), &token_settings())
}

/// Exchanger with local login and both registered clients.
pub fn exchanger(keys: &KeyPairs) -> Exchanger {
    Exchanger::new(Some(signer(keys)), AuthorizationCodeCodec::new(CODE_SECRET))
        .with_provider(provider())
        .with_clients(clients())
}

fn state_with(keys: KeyPairs, exchanger: Exchanger) -> AppState {
    let engine = AuthEngine::new(
        keys,
        token_settings(),
        exchanger,
        StateSigner::new(CODE_SECRET).unwrap(),
    );
    AppState::new(engine, settings())
}

pub fn app_state() -> AppState {
    let keys = keys();
    let exchanger = exchanger(&keys);
    state_with(keys, exchanger)
}

pub fn app_state_with_oidc(oidc: OidcProvider) -> AppState {
    let keys = keys();
    let exchanger = exchanger(&keys).with_oidc(oidc);
    state_with(keys, exchanger)
}

/// No signing keys: authentication disabled.
pub fn disabled_app_state() -> AppState {
    state_with(
        KeyPairs::default(),
        Exchanger::new(None, AuthorizationCodeCodec::new(CODE_SECRET)),
    )
}

// ---- Mock OIDC provider ----

const MOCK_KID: &str = "mock-key";
const MOCK_CLIENT_ID: &str = "platform";
const MOCK_CLIENT_SECRET: &str = "mock-secret";

struct MockShared {
    issuer: String,
    keys: KeyPairs,
}

impl MockShared {
    fn sign(&self, mut claims: Value, kid: &str) -> String {
        let now = Utc::now().timestamp();
        if let Some(object) = claims.as_object_mut() {
            object.entry("iss").or_insert_with(|| json!(self.issuer));
            object.entry("aud").or_insert_with(|| json!(MOCK_CLIENT_ID));
            object.entry("iat").or_insert_with(|| json!(now));
            object.entry("exp").or_insert_with(|| json!(now + 300));
        }
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(kid.to_string());
        let key = self.keys.active().unwrap();
        encode(&header, &claims, key.encoding_key()).unwrap()
    }
}

#[derive(Deserialize)]
struct MockTokenForm {
    code: String,
}

/// In-process OIDC provider on `127.0.0.1:0` serving discovery, JWKS and a
/// token endpoint.
pub struct MockOidc {
    pub issuer: String,
    pub client_id: String,
    shared: Arc<MockShared>,
}

impl MockOidc {
    /// Code that yields an identity token for [`MockOidc::SUBJECT`].
    pub const GOOD_CODE: &'static str = "good-code";
    /// Code whose token response lacks `id_token`.
    pub const NO_ID_TOKEN_CODE: &'static str = "no-id-token";
    pub const SUBJECT: &'static str = "upstream|42";

    pub async fn start() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let issuer = format!("http://{}", listener.local_addr().unwrap());
        let shared = Arc::new(MockShared {
            issuer: issuer.clone(),
            keys: KeyPairs::new(vec![key(MOCK_KID)]),
        });

        let app = Router::new()
            .route("/.well-known/openid-configuration", get(mock_discovery))
            .route("/jwks", get(mock_jwks))
            .route("/token", post(mock_token))
            .with_state(shared.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            issuer,
            client_id: MOCK_CLIENT_ID.to_string(),
            shared,
        }
    }

    pub fn settings(&self) -> OidcSettings {
        OidcSettings {
            issuer_url: self.issuer.clone(),
            client_id: self.client_id.clone(),
            client_secret: MOCK_CLIENT_SECRET.to_string(),
            redirect_url: "http://localhost:8080/auth/oidc/callback".to_string(),
            scopes: vec!["openid".to_string(), "email".to_string()],
        }
    }

    /// Sign `claims` with the provider's key; `iss`, `aud` and `exp` are
    /// filled in when absent.
    pub fn id_token(&self, claims: Value) -> String {
        self.shared.sign(claims, MOCK_KID)
    }

    pub fn id_token_with_kid(&self, claims: Value, kid: &str) -> String {
        self.shared.sign(claims, kid)
    }
}

async fn mock_discovery(State(shared): State<Arc<MockShared>>) -> Json<Value> {
    let issuer = &shared.issuer;
    Json(json!({
        "issuer": issuer,
        "authorization_endpoint": format!("{issuer}/authorize"),
        "token_endpoint": format!("{issuer}/token"),
        "jwks_uri": format!("{issuer}/jwks"),
    }))
}

async fn mock_jwks(State(shared): State<Arc<MockShared>>) -> Json<JwksDocument> {
    Json(JwksDocument::from_keys(&shared.keys))
}

async fn mock_token(
    State(shared): State<Arc<MockShared>>,
    headers: HeaderMap,
    Form(form): Form<MockTokenForm>,
) -> Response {
    let expected = format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD
            .encode(format!("{MOCK_CLIENT_ID}:{MOCK_CLIENT_SECRET}"))
    );
    if headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) != Some(expected.as_str()) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "invalid_client"}))).into_response();
    }

    match form.code.as_str() {
        MockOidc::GOOD_CODE => {
            let id_token = shared.sign(
                json!({
                    "sub": MockOidc::SUBJECT,
                    "email": "upstream@example.com",
                    "azp": MOCK_CLIENT_ID,
                    "roles": ["viewer"]
                }),
                MOCK_KID,
            );
            Json(json!({"access_token": "upstream-access", "id_token": id_token})).into_response()
        }
        MockOidc::NO_ID_TOKEN_CODE => Json(json!({"access_token": "upstream-access"})).into_response(),
        _ => (StatusCode::BAD_REQUEST, Json(json!({"error": "invalid_grant"}))).into_response(),
    }
}
