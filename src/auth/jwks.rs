// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! JWKS (JSON Web Key Set) publishing and upstream caching.
//!
//! ## Publishing
//!
//! [`JwksDocument`] renders every configured key pair, active or not, so
//! tokens signed before a rotation keep verifying downstream.
//!
//! ## Upstream
//!
//! [`JwksManager`] fetches the OIDC provider's key set:
//!
//! - Keys are cached with a configurable TTL
//! - An unknown `kid` forces one refresh before failing
//! - Stale cache is used on fetch failure
//! - Only RS256 and ES256 (P-256) keys are usable

use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::jwk::{AlgorithmParameters, EllipticCurve, Jwk, JwkSet, KeyAlgorithm};
use jsonwebtoken::{Algorithm, DecodingKey};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::warn;
use utoipa::ToSchema;

use super::error::AuthError;
use super::keys::{KeyPairs, PublicJwk};

/// Default JWKS cache TTL (5 minutes).
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Published key set.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct JwksDocument {
    pub keys: Vec<PublicJwk>,
}

impl JwksDocument {
    pub fn from_keys(keys: &KeyPairs) -> Self {
        Self {
            keys: keys.iter().map(|pair| pair.public_jwk().clone()).collect(),
        }
    }
}

/// JWKS cache entry.
struct CacheEntry {
    jwks: JwkSet,
    fetched_at: Instant,
}

/// Upstream JWKS manager with caching.
#[derive(Clone)]
pub struct JwksManager {
    /// JWKS URL from the provider's discovery document
    jwks_url: String,
    /// Cache TTL
    cache_ttl: Duration,
    /// Cached JWKS
    cache: Arc<RwLock<Option<CacheEntry>>>,
    /// HTTP client
    client: reqwest::Client,
}

impl JwksManager {
    pub fn new(jwks_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            jwks_url: jwks_url.into(),
            cache_ttl: DEFAULT_CACHE_TTL,
            cache: Arc::new(RwLock::new(None)),
            client,
        }
    }

    /// Create with custom cache TTL.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Get the JWKS URL.
    pub fn jwks_url(&self) -> &str {
        &self.jwks_url
    }

    /// Fetch JWKS (with caching).
    async fn get_jwks(&self) -> Result<JwkSet, AuthError> {
        let stale = {
            let cache = self.cache.read().await;
            match &*cache {
                Some(entry) if entry.fetched_at.elapsed() < self.cache_ttl => {
                    return Ok(entry.jwks.clone());
                }
                Some(entry) => Some(entry.jwks.clone()),
                None => None,
            }
        };

        match self.refresh().await {
            Ok(jwks) => Ok(jwks),
            Err(err) => match stale {
                Some(jwks) => {
                    warn!(error = %err, jwks_url = %self.jwks_url, "JWKS refresh failed, using stale keys");
                    Ok(jwks)
                }
                None => Err(err),
            },
        }
    }

    /// Fetch JWKS from the endpoint.
    async fn fetch_jwks(&self) -> Result<JwkSet, AuthError> {
        let response = self
            .client
            .get(&self.jwks_url)
            .send()
            .await
            .map_err(|e| AuthError::JwksFetchError(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AuthError::JwksFetchError(format!(
                "HTTP {} from JWKS endpoint",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| AuthError::JwksFetchError(e.to_string()))
    }

    /// Get a decoding key for the given key ID.
    ///
    /// An unknown `kid` triggers one forced refresh, covering provider key
    /// rotation inside the cache TTL.
    pub async fn get_decoding_key(&self, kid: &str) -> Result<(DecodingKey, Algorithm), AuthError> {
        let jwks = self.get_jwks().await?;
        if let Some(jwk) = find_key(&jwks, kid) {
            return jwk_to_decoding_key(jwk);
        }

        let jwks = self.refresh().await?;
        let jwk = find_key(&jwks, kid).ok_or(AuthError::NoMatchingKey)?;
        jwk_to_decoding_key(jwk)
    }

    /// Get the first usable key (for tokens without kid).
    pub async fn get_any_decoding_key(&self) -> Result<(DecodingKey, Algorithm), AuthError> {
        let jwks = self.get_jwks().await?;
        jwks.keys
            .iter()
            .find_map(|jwk| jwk_to_decoding_key(jwk).ok())
            .ok_or(AuthError::NoMatchingKey)
    }

    /// Force refresh the JWKS cache.
    pub async fn refresh(&self) -> Result<JwkSet, AuthError> {
        let jwks = self.fetch_jwks().await?;
        let mut cache = self.cache.write().await;
        *cache = Some(CacheEntry {
            jwks: jwks.clone(),
            fetched_at: Instant::now(),
        });
        Ok(jwks)
    }

    /// Check if JWKS is currently cached and valid.
    pub async fn is_cached(&self) -> bool {
        let cache = self.cache.read().await;
        if let Some(entry) = &*cache {
            entry.fetched_at.elapsed() < self.cache_ttl
        } else {
            false
        }
    }
}

fn find_key<'a>(jwks: &'a JwkSet, kid: &str) -> Option<&'a Jwk> {
    jwks.keys
        .iter()
        .find(|k| k.common.key_id.as_deref() == Some(kid))
}

/// Convert a JWK to a DecodingKey, accepting only RS256 and ES256.
fn jwk_to_decoding_key(jwk: &Jwk) -> Result<(DecodingKey, Algorithm), AuthError> {
    match &jwk.algorithm {
        AlgorithmParameters::RSA(rsa) => {
            if !matches!(jwk.common.key_algorithm, None | Some(KeyAlgorithm::RS256)) {
                return Err(AuthError::UnsupportedAlgorithm);
            }
            let key = DecodingKey::from_rsa_components(&rsa.n, &rsa.e)
                .map_err(|e| AuthError::InternalError(format!("Failed to create RSA key: {e}")))?;
            Ok((key, Algorithm::RS256))
        }
        AlgorithmParameters::EllipticCurve(ec) => {
            if ec.curve != EllipticCurve::P256
                || !matches!(jwk.common.key_algorithm, None | Some(KeyAlgorithm::ES256))
            {
                return Err(AuthError::UnsupportedAlgorithm);
            }
            let key = DecodingKey::from_ec_components(&ec.x, &ec.y)
                .map_err(|e| AuthError::InternalError(format!("Failed to create EC key: {e}")))?;
            Ok((key, Algorithm::ES256))
        }
        _ => Err(AuthError::UnsupportedAlgorithm),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::keys::{KeyPair, PrivateKey};
    use axum::{routing::get, Json, Router};
    use rand::rngs::OsRng;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(kid: &str) -> KeyPair {
        KeyPair::new(kid, PrivateKey::Ecdsa(p256::SecretKey::random(&mut OsRng)), true).unwrap()
    }

    /// Serve a JWKS whose contents can be swapped, counting fetches.
    async fn serve(
        document: Arc<std::sync::Mutex<JwksDocument>>,
        hits: Arc<AtomicUsize>,
    ) -> String {
        let app = Router::new().route(
            "/jwks",
            get(move || {
                let document = document.clone();
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    let body = document.lock().unwrap().clone();
                    Json(body)
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/jwks")
    }

    #[test]
    fn document_lists_every_key() {
        let keys = KeyPairs::new(vec![key("a"), key("b")]);
        let value = serde_json::to_value(JwksDocument::from_keys(&keys)).unwrap();
        let keys = value["keys"].as_array().unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0]["kty"], "EC");
        assert_eq!(keys[0]["use"], "sig");
        assert_eq!(keys[0]["alg"], "ES256");
        assert!(keys[0].get("n").is_none());
    }

    #[test]
    fn custom_cache_ttl() {
        let manager = JwksManager::new("http://127.0.0.1:1/jwks", reqwest::Client::new())
            .with_cache_ttl(Duration::from_secs(60));
        assert_eq!(manager.cache_ttl, Duration::from_secs(60));
        assert_eq!(manager.jwks_url(), "http://127.0.0.1:1/jwks");
    }

    #[tokio::test]
    async fn caches_and_refreshes_on_unknown_kid() {
        let document = Arc::new(std::sync::Mutex::new(JwksDocument::from_keys(
            &KeyPairs::new(vec![key("k1")]),
        )));
        let hits = Arc::new(AtomicUsize::new(0));
        let url = serve(document.clone(), hits.clone()).await;
        let manager = JwksManager::new(url, reqwest::Client::new());

        assert!(!manager.is_cached().await);
        let (_, alg) = manager.get_decoding_key("k1").await.unwrap();
        assert_eq!(alg, Algorithm::ES256);
        manager.get_decoding_key("k1").await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(manager.is_cached().await);

        *document.lock().unwrap() = JwksDocument::from_keys(&KeyPairs::new(vec![key("k2")]));
        manager.get_decoding_key("k2").await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        assert!(matches!(
            manager.get_decoding_key("k3").await,
            Err(AuthError::NoMatchingKey)
        ));
        assert!(manager.get_any_decoding_key().await.is_ok());
    }

    #[tokio::test]
    async fn unreachable_endpoint_without_cache_fails() {
        let manager = JwksManager::new("http://127.0.0.1:1/jwks", reqwest::Client::new());
        assert!(matches!(
            manager.get_decoding_key("k1").await,
            Err(AuthError::JwksFetchError(_))
        ));
    }
}
