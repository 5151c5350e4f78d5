// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Upstream OpenID Connect provider client.
//!
//! ## Lifecycle
//!
//! 1. [`OidcProvider::discover`] fetches the discovery document at startup;
//!    failure is fatal.
//! 2. [`OidcProvider::auth_code_url`] builds the browser redirect.
//! 3. [`OidcProvider::exchange_code`] trades the returned code for tokens and
//!    extracts the identity token.
//! 4. [`OidcProvider::verify_id_token`] checks it against the provider's
//!    published keys, issuer and our client id.
//!
//! Outbound calls are never retried here. Dropping the returned future
//! cancels the request.

use std::time::Duration;

use jsonwebtoken::{decode, decode_header, Validation};
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use super::claims::ClaimSet;
use super::error::AuthError;
use super::jwks::JwksManager;

/// Per-request timeout for provider calls.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Clock skew tolerance (60 seconds).
const CLOCK_SKEW_LEEWAY: u64 = 60;

/// Upstream provider configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OidcSettings {
    pub issuer_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_url: String,
    pub scopes: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum OidcError {
    #[error("OIDC discovery failed: {0}")]
    Discovery(String),

    #[error("OIDC issuer mismatch: expected {expected}, provider reports {found}")]
    IssuerMismatch { expected: String, found: String },

    #[error("OIDC provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("OIDC token endpoint returned HTTP {0}")]
    TokenEndpoint(u16),

    #[error("OIDC token response has no id_token")]
    MissingIdToken,

    #[error("identity token rejected: {0}")]
    Token(#[from] AuthError),

    #[error("invalid OIDC endpoint URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Endpoints from the provider's discovery document.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub jwks_uri: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    id_token: Option<String>,
}

/// Configured, discovered upstream provider.
#[derive(Clone)]
pub struct OidcProvider {
    settings: OidcSettings,
    metadata: ProviderMetadata,
    client: reqwest::Client,
    jwks: JwksManager,
}

impl OidcProvider {
    /// Fetch discovery metadata and prepare the key cache.
    pub async fn discover(settings: OidcSettings) -> Result<Self, OidcError> {
        let client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        let issuer = settings.issuer_url.trim_end_matches('/');
        let discovery_url = format!("{issuer}/.well-known/openid-configuration");

        let response = client.get(&discovery_url).send().await?;
        if !response.status().is_success() {
            return Err(OidcError::Discovery(format!(
                "HTTP {} from {discovery_url}",
                response.status()
            )));
        }
        let metadata: ProviderMetadata = response
            .json()
            .await
            .map_err(|e| OidcError::Discovery(e.to_string()))?;

        if metadata.issuer.trim_end_matches('/') != issuer {
            return Err(OidcError::IssuerMismatch {
                expected: issuer.to_string(),
                found: metadata.issuer,
            });
        }

        Url::parse(&metadata.authorization_endpoint)?;
        Url::parse(&metadata.token_endpoint)?;

        info!(
            issuer = %metadata.issuer,
            jwks_uri = %metadata.jwks_uri,
            "Discovered OIDC provider"
        );

        let jwks = JwksManager::new(metadata.jwks_uri.clone(), client.clone());
        Ok(Self {
            settings,
            metadata,
            client,
            jwks,
        })
    }

    pub fn metadata(&self) -> &ProviderMetadata {
        &self.metadata
    }

    pub fn client_id(&self) -> &str {
        &self.settings.client_id
    }

    /// Browser redirect to the provider's authorization endpoint.
    pub fn auth_code_url(&self, state: &str) -> Result<String, OidcError> {
        let scope = self.settings.scopes.join(" ");
        let url = Url::parse_with_params(
            &self.metadata.authorization_endpoint,
            &[
                ("response_type", "code"),
                ("client_id", self.settings.client_id.as_str()),
                ("redirect_uri", self.settings.redirect_url.as_str()),
                ("scope", scope.as_str()),
                ("state", state),
            ],
        )?;
        Ok(url.into())
    }

    /// Exchange an authorization code for the raw identity token.
    pub async fn exchange_code(&self, code: &str) -> Result<String, OidcError> {
        let response = self
            .client
            .post(&self.metadata.token_endpoint)
            .basic_auth(&self.settings.client_id, Some(&self.settings.client_secret))
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.settings.redirect_url.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(OidcError::TokenEndpoint(response.status().as_u16()));
        }

        let tokens: TokenResponse = response.json().await?;
        tokens
            .id_token
            .filter(|t| !t.is_empty())
            .ok_or(OidcError::MissingIdToken)
    }

    /// Verify an identity token against the provider's keys and our client id.
    pub async fn verify_id_token(&self, raw: &str) -> Result<ClaimSet, OidcError> {
        let header = decode_header(raw).map_err(|_| AuthError::MalformedToken)?;

        let (key, algorithm) = match header.kid.as_deref() {
            Some(kid) => self.jwks.get_decoding_key(kid).await?,
            None => self.jwks.get_any_decoding_key().await?,
        };
        if header.alg != algorithm {
            return Err(AuthError::UnsupportedAlgorithm.into());
        }

        let mut validation = Validation::new(algorithm);
        validation.leeway = CLOCK_SKEW_LEEWAY;
        validation.set_issuer(&[&self.metadata.issuer]);
        validation.set_audience(&[&self.settings.client_id]);
        validation.set_required_spec_claims(&["exp", "sub", "iss", "aud"]);

        let data = decode::<ClaimSet>(raw, &key, &validation).map_err(AuthError::from)?;
        if data.claims.subject().is_none() {
            return Err(AuthError::MissingSubject.into());
        }

        debug!(subject = ?data.claims.subject(), "Verified upstream identity token");
        Ok(data.claims)
    }

    /// Whether the upstream key set is currently cached.
    pub async fn keys_cached(&self) -> bool {
        self.jwks.is_cached().await
    }

    /// Fetch the upstream key set now.
    pub async fn refresh_keys(&self) -> Result<(), AuthError> {
        self.jwks.refresh().await.map(|_| ())
    }
}

impl std::fmt::Debug for OidcProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OidcProvider")
            .field("issuer", &self.metadata.issuer)
            .field("client_id", &self.settings.client_id)
            .finish_non_exhaustive()
    }
}
