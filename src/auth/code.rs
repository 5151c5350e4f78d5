// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Self-contained authorization codes.
//!
//! A code is `base64url(nonce || AES-256-GCM(json(claims)))`. The key is the
//! SHA-256 digest of the configured secret, so any secret length works.
//! Authenticated encryption means a tampered code fails to decrypt; no
//! separate signature is needed.
//!
//! Codes are single use: [`RedeemedCodes`] remembers the digest of every
//! redeemed code until it would have expired anyway.

use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::Utc;
use lru::LruCache;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Default code lifetime (10 minutes).
pub const DEFAULT_CODE_TTL_SECONDS: i64 = 600;

/// Default number of redeemed codes remembered.
pub const DEFAULT_LEDGER_CAPACITY: usize = 65_536;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Binds ciphertexts to this use of the key.
const CODE_AAD: &[u8] = b"authorization_code.v1";

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to serialize authorization code: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to encrypt authorization code")]
    Encrypt,

    #[error("authorization code is malformed")]
    Malformed,

    #[error("authorization code failed authenticated decryption")]
    Decrypt,

    #[error("authorization code has expired")]
    Expired,
}

/// Everything an authorization code carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationCodeClaims {
    #[serde(rename = "sub")]
    pub subject: String,
    pub client_id: String,
    #[serde(default)]
    pub scope: String,
    pub redirect_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge_method: Option<String>,
    #[serde(default)]
    pub auth_method: String,
    /// Unix timestamp; `0` means unset
    #[serde(default)]
    pub exp: i64,
}

/// Encrypts and decrypts authorization codes.
pub struct AuthorizationCodeCodec {
    cipher: Aes256Gcm,
}

impl AuthorizationCodeCodec {
    pub fn new(secret: &[u8]) -> Self {
        let key = Sha256::digest(secret);
        Self {
            cipher: Aes256Gcm::new(&key),
        }
    }

    /// Encrypt `claims`, defaulting `exp` to ten minutes from now.
    pub fn encode(&self, claims: &AuthorizationCodeClaims) -> Result<String, CodecError> {
        let mut claims = claims.clone();
        if claims.exp == 0 {
            claims.exp = Utc::now().timestamp() + DEFAULT_CODE_TTL_SECONDS;
        }
        let plaintext = serde_json::to_vec(&claims)?;

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(
                &Nonce::from(nonce),
                Payload {
                    msg: &plaintext,
                    aad: CODE_AAD,
                },
            )
            .map_err(|_| CodecError::Encrypt)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(Base64UrlUnpadded::encode_string(&sealed))
    }

    /// Decrypt a code, rejecting tampered and expired ones.
    ///
    /// Client and redirect binding are checked by the caller.
    pub fn decode(&self, code: &str) -> Result<AuthorizationCodeClaims, CodecError> {
        let sealed = Base64UrlUnpadded::decode_vec(code).map_err(|_| CodecError::Malformed)?;
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(CodecError::Malformed);
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce: [u8; NONCE_LEN] = nonce.try_into().map_err(|_| CodecError::Malformed)?;
        let plaintext = self
            .cipher
            .decrypt(
                &Nonce::from(nonce),
                Payload {
                    msg: ciphertext,
                    aad: CODE_AAD,
                },
            )
            .map_err(|_| CodecError::Decrypt)?;

        let claims: AuthorizationCodeClaims =
            serde_json::from_slice(&plaintext).map_err(|_| CodecError::Malformed)?;

        if claims.exp <= Utc::now().timestamp() {
            return Err(CodecError::Expired);
        }

        Ok(claims)
    }
}

impl std::fmt::Debug for AuthorizationCodeCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationCodeCodec").finish_non_exhaustive()
    }
}

/// Bounded ledger of redeemed codes, keyed by SHA-256 of the code.
pub struct RedeemedCodes {
    entries: Mutex<LruCache<[u8; 32], i64>>,
}

impl RedeemedCodes {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    /// Record `code` as redeemed. Returns `false` if it already was.
    ///
    /// `expires_at` is the code's own expiry; entries past it are dropped
    /// since the codec rejects those codes anyway.
    pub fn consume(&self, code: &str, expires_at: i64) -> bool {
        let digest: [u8; 32] = Sha256::digest(code.as_bytes()).into();
        let now = Utc::now().timestamp();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(&exp) = entries.get(&digest) {
            if exp > now {
                return false;
            }
        }

        while let Some((_, &exp)) = entries.peek_lru() {
            if exp > now {
                break;
            }
            entries.pop_lru();
        }

        entries.put(digest, expires_at);
        true
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RedeemedCodes {
    fn default() -> Self {
        Self::new(DEFAULT_LEDGER_CAPACITY)
    }
}
