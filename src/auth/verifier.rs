// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Verification of tokens minted by this engine.
//!
//! The key is chosen by the header `kid` among all configured keys, falling
//! back to the active key when no `kid` is present. The algorithm is pinned
//! to that key, and issuer, audience, `exp` and `sub` are always checked.

use jsonwebtoken::{decode, decode_header, Validation};

use super::claims::ClaimSet;
use super::error::AuthError;
use super::keys::KeyPairs;
use super::signer::TokenSettings;

/// Clock skew tolerance (60 seconds).
const CLOCK_SKEW_LEEWAY: u64 = 60;

#[derive(Debug, Clone)]
pub struct TokenVerifier {
    keys: KeyPairs,
    issuer: String,
    audience: String,
}

impl TokenVerifier {
    pub fn new(keys: KeyPairs, settings: &TokenSettings) -> Self {
        Self {
            keys,
            issuer: settings.issuer.clone(),
            audience: settings.audience.clone(),
        }
    }

    /// Verify an access token.
    pub fn verify(&self, token: &str) -> Result<ClaimSet, AuthError> {
        self.verify_for(token, &self.audience)
    }

    /// Verify a token minted for `audience`.
    pub fn verify_for(&self, token: &str, audience: &str) -> Result<ClaimSet, AuthError> {
        let header = decode_header(token).map_err(|_| AuthError::MalformedToken)?;

        let key = match header.kid.as_deref() {
            Some(kid) => self.keys.find(kid),
            None => self.keys.active(),
        }
        .ok_or(AuthError::NoMatchingKey)?;

        if header.alg != key.algorithm() {
            return Err(AuthError::UnsupportedAlgorithm);
        }

        let mut validation = Validation::new(key.algorithm());
        validation.leeway = CLOCK_SKEW_LEEWAY;
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[audience]);
        validation.set_required_spec_claims(&["exp", "sub", "iss", "aud"]);

        let data = decode::<ClaimSet>(token, key.decoding_key(), &validation)?;

        if data.claims.subject().is_none() {
            return Err(AuthError::MissingSubject);
        }

        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::keys::{KeyPair, PrivateKey};
    use crate::auth::signer::Signer;
    use chrono::Utc;
    use jsonwebtoken::{encode, Algorithm, Header};
    use rand::rngs::OsRng;
    use serde_json::json;

    fn key(kid: &str, active: bool) -> KeyPair {
        KeyPair::new(
            kid,
            PrivateKey::Ecdsa(p256::SecretKey::random(&mut OsRng)),
            active,
        )
        .unwrap()
    }

    fn settings() -> TokenSettings {
        TokenSettings {
            issuer: "https://id.example.com".to_string(),
            audience: "https://api.example.com".to_string(),
            ttl_seconds: 600,
        }
    }

    fn context() -> ClaimSet {
        let mut claims = ClaimSet::new();
        claims.insert("sub", "user_1");
        claims
    }

    #[test]
    fn identity_token_is_not_an_access_token() {
        let keys = KeyPairs::new(vec![key("k1", true)]);
        let signer = Signer::new(keys.clone(), settings(), None);
        let id_token = signer.sign_for(&context(), "client-1").unwrap();

        let verifier = TokenVerifier::new(keys, &settings());
        assert!(matches!(
            verifier.verify(&id_token),
            Err(AuthError::InvalidAudience)
        ));
        assert!(verifier.verify_for(&id_token, "client-1").is_ok());
    }

    #[test]
    fn rotated_out_key_still_verifies() {
        let old = key("old", false);
        let old_signer = Signer::new(
            KeyPairs::new(vec![key("old", true)]),
            settings(),
            None,
        );
        // Same kid, different material: must not verify.
        let forged = old_signer.sign(&context()).unwrap();

        let keys = KeyPairs::new(vec![old, key("new", true)]);
        let verifier = TokenVerifier::new(keys.clone(), &settings());
        assert!(verifier.verify(&forged).is_err());

        let current = Signer::new(keys.clone(), settings(), None);
        let token = current.sign(&context()).unwrap();
        assert_eq!(
            jsonwebtoken::decode_header(&token).unwrap().kid.as_deref(),
            Some("new")
        );
        assert!(verifier.verify(&token).is_ok());

        let old_key = keys.find("old").unwrap();
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some("old".to_string());
        let now = Utc::now().timestamp();
        let old_token = encode(
            &header,
            &json!({"sub": "user_1", "iss": "https://id.example.com",
                    "aud": "https://api.example.com", "exp": now + 60, "iat": now}),
            old_key.encoding_key(),
        )
        .unwrap();
        assert!(verifier.verify(&old_token).is_ok());
    }

    #[test]
    fn rejects_unknown_kid_and_wrong_issuer() {
        let keys = KeyPairs::new(vec![key("k1", true)]);
        let signer = Signer::new(keys.clone(), settings(), None);
        let token = signer.sign(&context()).unwrap();

        let other = TokenVerifier::new(KeyPairs::new(vec![key("k2", true)]), &settings());
        assert!(matches!(other.verify(&token), Err(AuthError::NoMatchingKey)));

        let mut foreign = settings();
        foreign.issuer = "https://evil.example.com".to_string();
        let verifier = TokenVerifier::new(keys, &foreign);
        assert!(matches!(
            verifier.verify(&token),
            Err(AuthError::InvalidIssuer)
        ));
    }

    #[test]
    fn rejects_expired_and_garbage_tokens() {
        let keys = KeyPairs::new(vec![key("k1", true)]);
        let mut expired = settings();
        expired.ttl_seconds = -3600;
        let token = Signer::new(keys.clone(), expired, None)
            .sign(&context())
            .unwrap();

        let verifier = TokenVerifier::new(keys, &settings());
        assert!(matches!(
            verifier.verify(&token),
            Err(AuthError::TokenExpired)
        ));
        assert!(matches!(
            verifier.verify("not-a-token"),
            Err(AuthError::MalformedToken)
        ));
    }

    #[test]
    fn token_without_kid_uses_active_key() {
        let keys = KeyPairs::new(vec![key("k1", true)]);
        let active = keys.active().unwrap();
        let now = Utc::now().timestamp();
        let token = encode(
            &Header::new(Algorithm::ES256),
            &json!({"sub": "user_1", "iss": "https://id.example.com",
                    "aud": "https://api.example.com", "exp": now + 60}),
            active.encoding_key(),
        )
        .unwrap();

        let verifier = TokenVerifier::new(keys.clone(), &settings());
        assert!(verifier.verify(&token).is_ok());

        let no_subject = encode(
            &Header::new(Algorithm::ES256),
            &json!({"iss": "https://id.example.com",
                    "aud": "https://api.example.com", "exp": now + 60}),
            active.encoding_key(),
        )
        .unwrap();
        assert!(verifier.verify(&no_subject).is_err());
    }
}
