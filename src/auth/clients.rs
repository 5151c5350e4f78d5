// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Static OAuth2 client registrations.
//!
//! ## File format
//!
//! ```json
//! [
//!   {
//!     "client_id": "web",
//!     "public": true,
//!     "redirect_uris": ["https://app.example.com/callback"],
//!     "allowed_grant_types": ["authorization_code"],
//!     "allowed_scopes": ["pages::read"]
//!   },
//!   {
//!     "client_id": "builder",
//!     "client_secret": "s3cret",
//!     "allowed_grant_types": ["client_credentials"],
//!     "allowed_scopes": ["volumes::all"]
//!   }
//! ]
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use super::entitlements;

pub const GRANT_AUTHORIZATION_CODE: &str = "authorization_code";
pub const GRANT_CLIENT_CREDENTIALS: &str = "client_credentials";
pub const GRANT_PASSWORD: &str = "password";
pub const GRANT_REFRESH_TOKEN: &str = "refresh_token";

pub const SCOPE_OPENID: &str = "openid";
pub const SCOPE_PROFILE: &str = "profile";
pub const SCOPE_EMAIL: &str = "email";
pub const SCOPE_ROLES: &str = "roles";
pub const SCOPE_ENTITLEMENTS: &str = "entitlements";

/// Scopes any user-facing client may request.
pub const IDENTITY_SCOPES: &[&str] = &[
    SCOPE_OPENID,
    SCOPE_PROFILE,
    SCOPE_EMAIL,
    SCOPE_ROLES,
    SCOPE_ENTITLEMENTS,
];

#[derive(Debug, thiserror::Error)]
pub enum ClientRegistryError {
    #[error("failed to read client registrations from {path}: {reason}")]
    Load { path: String, reason: String },

    #[error("duplicate client id: {0}")]
    DuplicateClient(String),

    #[error("client {0} is public but has a secret")]
    PublicWithSecret(String),

    #[error("client {0} has an empty client id")]
    EmptyClientId(String),
}

/// A registered client.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthClient {
    pub client_id: String,
    #[serde(default, skip_serializing)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    pub allowed_grant_types: Vec<String>,
    #[serde(default)]
    pub allowed_scopes: Vec<String>,
    #[serde(default)]
    pub require_pkce: bool,
}

impl AuthClient {
    /// A client without a secret is public whatever its flag says.
    pub fn is_public(&self) -> bool {
        self.public || self.client_secret.as_deref().is_none_or(str::is_empty)
    }

    pub fn requires_pkce(&self) -> bool {
        self.require_pkce || self.is_public()
    }

    pub fn allows_grant(&self, grant_type: &str) -> bool {
        self.allowed_grant_types.iter().any(|g| g == grant_type)
    }

    /// Exact match only.
    pub fn has_redirect_uri(&self, redirect_uri: &str) -> bool {
        self.redirect_uris.iter().any(|uri| uri == redirect_uri)
    }

    /// Check a presented secret.
    ///
    /// Public clients must present none. Digests are compared so the
    /// comparison time does not depend on where the secrets differ or on
    /// their lengths.
    pub fn verify_secret(&self, presented: Option<&str>) -> bool {
        let presented = presented.filter(|s| !s.is_empty());
        if self.is_public() {
            return presented.is_none();
        }
        let (Some(expected), Some(presented)) = (self.client_secret.as_deref(), presented) else {
            return false;
        };
        let expected = Sha256::digest(expected.as_bytes());
        let presented = Sha256::digest(presented.as_bytes());
        expected.ct_eq(&presented).into()
    }

    /// Whether `scope` may be granted to this client.
    ///
    /// Identity scopes are only meaningful when a user is involved.
    pub fn permits_scope(&self, scope: &str, user_flow: bool) -> bool {
        (user_flow && IDENTITY_SCOPES.contains(&scope))
            || self
                .allowed_scopes
                .iter()
                .any(|allowed| entitlements::scope_matches(allowed, scope))
    }

    /// First requested scope this client may not have, if any.
    pub fn first_forbidden_scope<'a>(
        &self,
        requested: &'a [String],
        user_flow: bool,
    ) -> Option<&'a str> {
        requested
            .iter()
            .map(String::as_str)
            .find(|scope| !self.permits_scope(scope, user_flow))
    }
}

impl std::fmt::Debug for AuthClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthClient")
            .field("client_id", &self.client_id)
            .field("public", &self.is_public())
            .field("redirect_uris", &self.redirect_uris)
            .field("allowed_grant_types", &self.allowed_grant_types)
            .field("allowed_scopes", &self.allowed_scopes)
            .field("require_pkce", &self.require_pkce)
            .finish_non_exhaustive()
    }
}

/// Read-only client registry.
#[derive(Debug, Clone, Default)]
pub struct ClientRegistry {
    clients: HashMap<String, AuthClient>,
}

impl ClientRegistry {
    pub fn new(clients: Vec<AuthClient>) -> Result<Self, ClientRegistryError> {
        let mut registry = HashMap::with_capacity(clients.len());
        for client in clients {
            if client.client_id.trim().is_empty() {
                return Err(ClientRegistryError::EmptyClientId(client.client_id));
            }
            if client.public && client.client_secret.as_deref().is_some_and(|s| !s.is_empty()) {
                return Err(ClientRegistryError::PublicWithSecret(client.client_id));
            }
            if registry.contains_key(&client.client_id) {
                return Err(ClientRegistryError::DuplicateClient(client.client_id));
            }
            registry.insert(client.client_id.clone(), client);
        }
        Ok(Self { clients: registry })
    }

    /// Load a JSON array of registrations.
    pub fn from_file(path: &Path) -> Result<Self, ClientRegistryError> {
        let load_error = |reason: String| ClientRegistryError::Load {
            path: path.display().to_string(),
            reason,
        };
        let raw = std::fs::read_to_string(path).map_err(|e| load_error(e.to_string()))?;
        let clients: Vec<AuthClient> =
            serde_json::from_str(&raw).map_err(|e| load_error(e.to_string()))?;
        Self::new(clients)
    }

    pub fn get(&self, client_id: &str) -> Option<&AuthClient> {
        self.clients.get(client_id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn confidential() -> AuthClient {
        AuthClient {
            client_id: "builder".to_string(),
            client_secret: Some("s3cret".to_string()),
            public: false,
            redirect_uris: vec!["http://localhost/cb".to_string()],
            allowed_grant_types: vec![GRANT_CLIENT_CREDENTIALS.to_string()],
            allowed_scopes: vec!["volumes::all".to_string()],
            require_pkce: false,
        }
    }

    fn public() -> AuthClient {
        AuthClient {
            client_id: "web".to_string(),
            client_secret: None,
            public: true,
            redirect_uris: vec!["http://localhost/cb".to_string()],
            allowed_grant_types: vec![GRANT_AUTHORIZATION_CODE.to_string()],
            allowed_scopes: vec![],
            require_pkce: false,
        }
    }

    #[test]
    fn secret_verification() {
        let client = confidential();
        assert!(client.verify_secret(Some("s3cret")));
        assert!(!client.verify_secret(Some("s3cre")));
        assert!(!client.verify_secret(None));

        let web = public();
        assert!(web.verify_secret(None));
        assert!(web.verify_secret(Some("")));
        assert!(!web.verify_secret(Some("anything")));
    }

    #[test]
    fn public_clients_always_require_pkce() {
        assert!(public().requires_pkce());
        assert!(!confidential().requires_pkce());

        let mut implicit_public = confidential();
        implicit_public.client_secret = None;
        assert!(implicit_public.requires_pkce());
    }

    #[test]
    fn scope_allow_list() {
        let client = confidential();
        assert!(client.permits_scope("volumes:data:write", false));
        assert!(!client.permits_scope("pages::read", false));
        assert!(!client.permits_scope("openid", false));
        assert!(client.permits_scope("openid", true));

        let requested = vec!["volumes::read".to_string(), "secrets::read".to_string()];
        assert_eq!(
            client.first_forbidden_scope(&requested, false),
            Some("secrets::read")
        );
    }

    #[test]
    fn redirect_uris_match_exactly() {
        let client = public();
        assert!(client.has_redirect_uri("http://localhost/cb"));
        assert!(!client.has_redirect_uri("http://localhost/cb/"));
        assert!(!client.has_redirect_uri("http://localhost/other"));
    }

    #[test]
    fn registry_rejects_invalid_registrations() {
        assert!(matches!(
            ClientRegistry::new(vec![confidential(), confidential()]),
            Err(ClientRegistryError::DuplicateClient(_))
        ));

        let mut contradictory = public();
        contradictory.client_secret = Some("x".to_string());
        assert!(matches!(
            ClientRegistry::new(vec![contradictory]),
            Err(ClientRegistryError::PublicWithSecret(_))
        ));
    }

    #[test]
    fn registry_loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clients.json");
        std::fs::write(
            &path,
            r#"[{"client_id": "web", "public": true, "redirect_uris": ["http://localhost/cb"]}]"#,
        )
        .unwrap();

        let registry = ClientRegistry::from_file(&path).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.get("web").unwrap().is_public());
        assert!(registry.get("other").is_none());
    }
}
