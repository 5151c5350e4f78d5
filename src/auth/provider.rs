// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Identity resolution capability and the static, file-backed store.
//!
//! Flows depend only on [`ScopeProvider`]; the concrete store is chosen at
//! startup.

use std::collections::HashMap;
use std::path::Path;

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use async_trait::async_trait;
use rand::rngs::OsRng;
use serde::Deserialize;
use uuid::Uuid;

use super::claims::ClaimSet;

/// A resolved identity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Identity {
    pub subject: String,
    pub email: Option<String>,
    /// OIDC profile claims (`name`, `picture`, ...)
    pub profile: ClaimSet,
    pub roles: Vec<String>,
    pub entitlements: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("identity store unavailable: {0}")]
    Unavailable(String),

    #[error("failed to load identities from {path}: {reason}")]
    Load { path: String, reason: String },

    #[error("user {0} has an invalid password hash")]
    InvalidHash(String),

    #[error("duplicate user: {0}")]
    DuplicateUser(String),
}

/// Identity resolution backend.
#[async_trait]
pub trait ScopeProvider: Send + Sync {
    /// Verify a username and password. `None` means the credentials are wrong.
    async fn verify_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<Identity>, ProviderError>;

    /// Resolve current roles and entitlements. `None` means the subject is unknown.
    async fn resolve_roles_and_entitlements(
        &self,
        subject: &str,
    ) -> Result<Option<Identity>, ProviderError>;
}

#[derive(Debug, Clone, Deserialize)]
struct StaticUser {
    username: String,
    subject: String,
    password_hash: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    profile: ClaimSet,
    #[serde(default)]
    roles: Vec<String>,
    #[serde(default)]
    entitlements: Vec<String>,
}

impl StaticUser {
    fn identity(&self) -> Identity {
        Identity {
            subject: self.subject.clone(),
            email: self.email.clone(),
            profile: self.profile.clone(),
            roles: self.roles.clone(),
            entitlements: self.entitlements.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct StaticDocument {
    users: Vec<StaticUser>,
}

/// In-memory identity store loaded from JSON.
///
/// ```json
/// {"users": [{"username": "joe", "subject": "user_1",
///             "password_hash": "$argon2id$v=19$...", "email": "joe@example.com",
///             "profile": {"name": "Joe"}, "roles": ["admin"],
///             "entitlements": ["pages::read"]}]}
/// ```
#[derive(Debug)]
pub struct StaticScopeProvider {
    users: Vec<StaticUser>,
    by_username: HashMap<String, usize>,
    by_subject: HashMap<String, usize>,
    /// Verified against when the username is unknown so both failures cost the same
    decoy_hash: String,
}

impl StaticScopeProvider {
    fn new(users: Vec<StaticUser>) -> Result<Self, ProviderError> {
        let mut by_username = HashMap::with_capacity(users.len());
        let mut by_subject = HashMap::with_capacity(users.len());
        for (index, user) in users.iter().enumerate() {
            PasswordHash::new(&user.password_hash)
                .map_err(|_| ProviderError::InvalidHash(user.username.clone()))?;
            if by_username.insert(user.username.clone(), index).is_some()
                || by_subject.insert(user.subject.clone(), index).is_some()
            {
                return Err(ProviderError::DuplicateUser(user.username.clone()));
            }
        }

        let decoy_hash = hash_password(&Uuid::new_v4().to_string())
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;

        Ok(Self {
            users,
            by_username,
            by_subject,
            decoy_hash,
        })
    }

    pub fn from_json(raw: &str) -> Result<Self, ProviderError> {
        let document: StaticDocument =
            serde_json::from_str(raw).map_err(|e| ProviderError::Load {
                path: "<inline>".to_string(),
                reason: e.to_string(),
            })?;
        Self::new(document.users)
    }

    pub fn from_file(path: &Path) -> Result<Self, ProviderError> {
        let load_error = |reason: String| ProviderError::Load {
            path: path.display().to_string(),
            reason,
        };
        let raw = std::fs::read_to_string(path).map_err(|e| load_error(e.to_string()))?;
        let document: StaticDocument =
            serde_json::from_str(&raw).map_err(|e| load_error(e.to_string()))?;
        Self::new(document.users)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl ScopeProvider for StaticScopeProvider {
    async fn verify_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<Identity>, ProviderError> {
        let user = self.by_username.get(username).map(|&i| &self.users[i]);
        let hash = user
            .map(|u| u.password_hash.clone())
            .unwrap_or_else(|| self.decoy_hash.clone());
        let password = password.to_string();

        let matches = tokio::task::spawn_blocking(move || verify_password(&password, &hash))
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;

        Ok(user.filter(|_| matches).map(StaticUser::identity))
    }

    async fn resolve_roles_and_entitlements(
        &self,
        subject: &str,
    ) -> Result<Option<Identity>, ProviderError> {
        Ok(self
            .by_subject
            .get(subject)
            .map(|&i| self.users[i].identity()))
    }
}

/// Hash a password into an argon2id PHC string.
pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    Ok(Argon2::default()
        .hash_password(password.as_bytes(), &salt)?
        .to_string())
}

fn verify_password(password: &str, hash: &str) -> bool {
    PasswordHash::new(hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn provider() -> StaticScopeProvider {
        let document = json!({
            "users": [{
                "username": "joe",
                "subject": "user_joe",
                "password_hash": hash_password("correct").unwrap(),
                "email": "joe@example.com",
                "profile": {"name": "Joe", "locale": "en"},
                "roles": ["admin"],
                "entitlements": ["pages::read"]
            }]
        });
        StaticScopeProvider::from_json(&document.to_string()).unwrap()
    }

    #[tokio::test]
    async fn verifies_credentials() {
        let provider = provider();
        let identity = provider
            .verify_credentials("joe", "correct")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(identity.subject, "user_joe");
        assert_eq!(identity.profile.get_str("name"), Some("Joe"));
        assert_eq!(identity.roles, vec!["admin"]);
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_user_look_the_same() {
        let provider = provider();
        assert!(provider
            .verify_credentials("joe", "wrong")
            .await
            .unwrap()
            .is_none());
        assert!(provider
            .verify_credentials("mallory", "correct")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn resolves_by_subject() {
        let provider = provider();
        let identity = provider
            .resolve_roles_and_entitlements("user_joe")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(identity.entitlements, vec!["pages::read"]);
        assert!(provider
            .resolve_roles_and_entitlements("user_nobody")
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn rejects_bad_documents() {
        let bad_hash = json!({"users": [{"username": "a", "subject": "s", "password_hash": "plain"}]});
        assert!(matches!(
            StaticScopeProvider::from_json(&bad_hash.to_string()),
            Err(ProviderError::InvalidHash(_))
        ));

        let hash = hash_password("x").unwrap();
        let duplicate = json!({"users": [
            {"username": "a", "subject": "s1", "password_hash": hash},
            {"username": "a", "subject": "s2", "password_hash": hash}
        ]});
        assert!(matches!(
            StaticScopeProvider::from_json(&duplicate.to_string()),
            Err(ProviderError::DuplicateUser(_))
        ));
    }
}
