// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Token minting.
//!
//! Outbound claims are assembled in three layers, each overriding the one
//! before: claim-mapper output, pass-through claims copied from the signing
//! context, then the registered claims (`sub`, `iss`, `aud`, `exp`, `iat`,
//! `jti`). The JWS algorithm and `kid` header come from the active key.

use chrono::Utc;
use jsonwebtoken::{encode, Header};
use uuid::Uuid;

use super::claims::{
    ClaimSet, CLAIM_AUTH_METHOD, CLAIM_AZP, CLAIM_EMAIL, CLAIM_ENTITLEMENTS, CLAIM_GRANT_TYPE,
    CLAIM_ROLES, CLAIM_SCOPE, CLAIM_SUBJECT, PROFILE_CLAIMS,
};
use super::keys::KeyPairs;
use super::mapper::{ClaimMapper, MappingError};

/// Flow claims copied verbatim from the signing context.
pub const PASSTHROUGH_CLAIMS: &[&str] = &[
    CLAIM_EMAIL,
    CLAIM_ENTITLEMENTS,
    CLAIM_ROLES,
    CLAIM_SCOPE,
    CLAIM_AUTH_METHOD,
    CLAIM_AZP,
    CLAIM_GRANT_TYPE,
];

#[derive(Debug, thiserror::Error)]
pub enum SignError {
    #[error("signing context has no subject")]
    MissingSubject,

    #[error("no active signing key")]
    NoActiveKey,

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error("failed to encode token: {0}")]
    Encoding(#[from] jsonwebtoken::errors::Error),
}

/// Issuer, audience and lifetime of minted tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSettings {
    pub issuer: String,
    pub audience: String,
    pub ttl_seconds: i64,
}

/// Mints signed tokens with the active key.
#[derive(Debug, Clone)]
pub struct Signer {
    keys: KeyPairs,
    settings: TokenSettings,
    mapper: Option<ClaimMapper>,
}

impl Signer {
    pub fn new(keys: KeyPairs, settings: TokenSettings, mapper: Option<ClaimMapper>) -> Self {
        Self {
            keys,
            settings,
            mapper,
        }
    }

    pub fn keys(&self) -> &KeyPairs {
        &self.keys
    }

    pub fn settings(&self) -> &TokenSettings {
        &self.settings
    }

    /// Sign an access token for the configured audience.
    pub fn sign(&self, context: &ClaimSet) -> Result<String, SignError> {
        self.sign_for(context, &self.settings.audience)
    }

    /// Sign a token for an explicit audience (identity tokens use the client id).
    pub fn sign_for(&self, context: &ClaimSet, audience: &str) -> Result<String, SignError> {
        let subject = context.subject().ok_or(SignError::MissingSubject)?;
        let key = self.keys.active().ok_or(SignError::NoActiveKey)?;

        let mut claims = match &self.mapper {
            Some(mapper) => mapper.evaluate(context)?,
            None => ClaimSet::new(),
        };
        claims.remove("nbf");

        for name in PASSTHROUGH_CLAIMS.iter().chain(PROFILE_CLAIMS) {
            if let Some(value) = context.get(name) {
                claims.insert(*name, value.clone());
            }
        }

        let now = Utc::now().timestamp();
        claims.insert(CLAIM_SUBJECT, subject);
        claims.insert("iss", self.settings.issuer.as_str());
        claims.insert("aud", audience);
        claims.insert("exp", now + self.settings.ttl_seconds);
        claims.insert("iat", now);
        claims.insert("jti", Uuid::new_v4().to_string());

        let mut header = Header::new(key.algorithm());
        header.kid = Some(key.key_id().to_string());

        Ok(encode(&header, &claims, key.encoding_key())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::claims::ClaimValue;
    use crate::auth::keys::{KeyPair, PrivateKey};
    use crate::auth::mapper::ClaimRule;
    use crate::auth::verifier::TokenVerifier;
    use rand::rngs::OsRng;

    fn key(kid: &str) -> KeyPair {
        KeyPair::new(kid, PrivateKey::Ecdsa(p256::SecretKey::random(&mut OsRng)), true).unwrap()
    }

    fn settings() -> TokenSettings {
        TokenSettings {
            issuer: "https://id.example.com".to_string(),
            audience: "https://api.example.com".to_string(),
            ttl_seconds: 3600,
        }
    }

    fn context() -> ClaimSet {
        let mut claims = ClaimSet::new();
        claims.insert("sub", "user_1");
        claims.insert("email", "joe@example.com");
        claims.insert("roles", vec!["admin".to_string()]);
        claims.insert("name", "Joe");
        claims.insert("internal_note", "do not leak");
        claims
    }

    #[test]
    fn signed_token_verifies_and_keeps_subject() {
        let keys = KeyPairs::new(vec![key("k1")]);
        let signer = Signer::new(keys.clone(), settings(), None);
        let token = signer.sign(&context()).unwrap();

        let header = jsonwebtoken::decode_header(&token).unwrap();
        assert_eq!(header.kid.as_deref(), Some("k1"));
        assert_eq!(header.alg, jsonwebtoken::Algorithm::ES256);

        let verifier = TokenVerifier::new(keys, &settings());
        let claims = verifier.verify(&token).unwrap();
        assert_eq!(claims.subject(), Some("user_1"));
        assert_eq!(claims.get_str("email"), Some("joe@example.com"));
        assert_eq!(claims.get_str("name"), Some("Joe"));
        assert_eq!(claims.string_list("roles"), vec!["admin"]);
        assert!(!claims.contains_key("internal_note"));
        assert!(claims.get_str("jti").is_some());
    }

    #[test]
    fn token_from_other_key_fails_verification() {
        let signer = Signer::new(KeyPairs::new(vec![key("k1")]), settings(), None);
        let token = signer.sign(&context()).unwrap();

        let verifier = TokenVerifier::new(KeyPairs::new(vec![key("k1")]), &settings());
        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn jti_is_unique_per_token() {
        let signer = Signer::new(KeyPairs::new(vec![key("k1")]), settings(), None);
        let verifier = TokenVerifier::new(signer.keys().clone(), &settings());
        let a = verifier.verify(&signer.sign(&context()).unwrap()).unwrap();
        let b = verifier.verify(&signer.sign(&context()).unwrap()).unwrap();
        assert_ne!(a.get_str("jti"), b.get_str("jti"));
    }

    #[test]
    fn requires_subject_and_key() {
        let signer = Signer::new(KeyPairs::new(vec![key("k1")]), settings(), None);
        let mut anonymous = context();
        anonymous.remove("sub");
        assert!(matches!(
            signer.sign(&anonymous),
            Err(SignError::MissingSubject)
        ));

        let keyless = Signer::new(KeyPairs::default(), settings(), None);
        assert!(matches!(keyless.sign(&context()), Err(SignError::NoActiveKey)));
    }

    #[test]
    fn mapper_output_cannot_override_registered_claims() {
        let mapper = ClaimMapper::new(vec![
            ClaimRule {
                source: "'attacker'".to_string(),
                target: "sub".to_string(),
                required: true,
            },
            ClaimRule {
                source: "lower(claims.email)".to_string(),
                target: "profile.contact".to_string(),
                required: true,
            },
        ])
        .unwrap();
        let keys = KeyPairs::new(vec![key("k1")]);
        let signer = Signer::new(keys.clone(), settings(), Some(mapper));
        let claims = TokenVerifier::new(keys, &settings())
            .verify(&signer.sign(&context()).unwrap())
            .unwrap();

        assert_eq!(claims.subject(), Some("user_1"));
        let profile = claims.get("profile").and_then(ClaimValue::as_map).unwrap();
        assert_eq!(
            profile.get("contact"),
            Some(&ClaimValue::from("joe@example.com"))
        );
    }

    #[test]
    fn required_mapping_failure_aborts_signing() {
        let mapper = ClaimMapper::new(vec![ClaimRule {
            source: "claims.tenant".to_string(),
            target: "tenant".to_string(),
            required: true,
        }])
        .unwrap();
        let signer = Signer::new(KeyPairs::new(vec![key("k1")]), settings(), Some(mapper));
        assert!(matches!(signer.sign(&context()), Err(SignError::Mapping(_))));
    }
}
