// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Startup wiring of the authentication engine.
//!
//! Every configuration problem surfaces here as an [`EngineError`] so the
//! process never serves traffic with a half-configured signer.

use std::sync::Arc;

use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{info, warn};

use super::claims::{AuthContext, TokenSource};
use super::clients::{ClientRegistry, ClientRegistryError};
use super::code::AuthorizationCodeCodec;
use super::cookie::StateSigner;
use super::error::AuthError;
use super::exchange::Exchanger;
use super::jwks::JwksDocument;
use super::keys::{KeyError, KeyManager, KeyPairs};
use super::mapper::{ClaimMapper, MappingError};
use super::oidc::{OidcError, OidcProvider};
use super::provider::{ProviderError, StaticScopeProvider};
use super::signer::{Signer, TokenSettings};
use super::verifier::TokenVerifier;
use crate::config::Settings;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("signing keys: {0}")]
    Keys(#[from] KeyError),

    #[error("claim rules: {0}")]
    Mapping(#[from] MappingError),

    #[error("client registry: {0}")]
    Clients(#[from] ClientRegistryError),

    #[error("identity store: {0}")]
    Provider(#[from] ProviderError),

    #[error("OIDC provider: {0}")]
    Oidc(#[from] OidcError),

    #[error("failed to derive state signing key")]
    StateKey,
}

/// Fully wired authentication engine, shared read-only by every request.
#[derive(Debug)]
pub struct AuthEngine {
    keys: KeyPairs,
    token: TokenSettings,
    verifier: TokenVerifier,
    exchanger: Exchanger,
    state_signer: StateSigner,
}

impl AuthEngine {
    pub fn new(
        keys: KeyPairs,
        token: TokenSettings,
        exchanger: Exchanger,
        state_signer: StateSigner,
    ) -> Self {
        Self {
            verifier: TokenVerifier::new(keys.clone(), &token),
            keys,
            token,
            exchanger,
            state_signer,
        }
    }

    /// Load keys and collaborators named by `settings`.
    pub async fn from_settings(settings: &Settings) -> Result<Self, EngineError> {
        let key_manager = KeyManager::new(settings.key_settings());
        let keys = key_manager.load_or_generate()?;
        let token = settings.token_settings();

        let mapper = match &settings.claim_rules_file {
            Some(path) => {
                let mapper = ClaimMapper::from_file(path)?;
                info!(rules = mapper.len(), path = %path.display(), "Loaded claim rules");
                Some(mapper)
            }
            None => None,
        };

        let signer = (!keys.is_empty()).then(|| Signer::new(keys.clone(), token.clone(), mapper));

        let secret = match &settings.auth_code_secret {
            Some(secret) => secret.as_bytes().to_vec(),
            None => {
                warn!("AUTH_CODE_SECRET not set, authorization codes will not survive a restart");
                let mut secret = vec![0u8; 32];
                OsRng.fill_bytes(&mut secret);
                secret
            }
        };

        let mut exchanger = Exchanger::new(signer, AuthorizationCodeCodec::new(&secret));

        if let Some(path) = &settings.clients_file {
            let clients = ClientRegistry::from_file(path)?;
            info!(clients = clients.len(), "Loaded client registrations");
            exchanger = exchanger.with_clients(clients);
        }

        if let Some(path) = &settings.identities_file {
            let provider = StaticScopeProvider::from_file(path)?;
            info!(users = provider.len(), "Loaded local identities");
            exchanger = exchanger.with_provider(Arc::new(provider));
        }

        if let Some(oidc) = &settings.oidc {
            exchanger = exchanger.with_oidc(OidcProvider::discover(oidc.clone()).await?);
        }

        let state_signer = StateSigner::new(&secret).map_err(|_| EngineError::StateKey)?;

        info!(
            issuer = %token.issuer,
            audience = %token.audience,
            keys = keys.len(),
            auth_enabled = !keys.is_empty(),
            "Authentication engine ready"
        );

        Ok(Self::new(keys, token, exchanger, state_signer))
    }

    /// Authentication is disabled when no signing keys are configured.
    pub fn is_auth_enabled(&self) -> bool {
        !self.keys.is_empty()
    }

    /// Verify an access token into a request context.
    pub fn authenticate(&self, token: &str, source: TokenSource) -> Result<AuthContext, AuthError> {
        let claims = self.verifier.verify(token)?;
        AuthContext::from_claims(claims, source).ok_or(AuthError::MissingSubject)
    }

    pub fn keys(&self) -> &KeyPairs {
        &self.keys
    }

    pub fn token_settings(&self) -> &TokenSettings {
        &self.token
    }

    pub fn issuer(&self) -> &str {
        &self.token.issuer
    }

    pub fn verifier(&self) -> &TokenVerifier {
        &self.verifier
    }

    pub fn exchanger(&self) -> &Exchanger {
        &self.exchanger
    }

    pub fn state_signer(&self) -> &StateSigner {
        &self.state_signer
    }

    pub fn jwks(&self) -> JwksDocument {
        JwksDocument::from_keys(&self.keys)
    }
}
