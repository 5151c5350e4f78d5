// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Signing key loading, generation and selection.
//!
//! ## Key material
//!
//! Keys are PEM-encoded private keys. Each one is decoded by trying, in order,
//! PKCS#8 (algorithm-tagged), PKCS#1 (RSA) and SEC1 (elliptic curve). Only RSA
//! (>= 2048 bits, RS256) and P-256 ECDSA (ES256) keys are accepted; the
//! algorithm, encoding key, decoding key and public JWK are derived once at
//! load so an unsupported key can never reach the signer.
//!
//! ## Active key
//!
//! A single configured key is always active. With several keys the
//! configured hint must name one of them; the others are kept only to verify
//! tokens they signed earlier.
//!
//! ## Development mode
//!
//! Without configured keys and with development mode on, one P-256 key is
//! generated per process. Its key id embeds the process start time so public
//! keys cached by clients never validate against a later process.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, ObjectIdentifier, PrivateKeyInfo};
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde::Serialize;
use tracing::{info, warn};
use utoipa::ToSchema;

/// rsaEncryption (PKCS#1)
const RSA_ENCRYPTION_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");
/// id-ecPublicKey (RFC 5480)
const EC_PUBLIC_KEY_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");

const MIN_RSA_BITS: usize = 2048;

/// Key loading errors. All of them are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("failed to read signing key {key_id}: {source}")]
    Io {
        key_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("signing key {key_id} is not valid PEM: {reason}")]
    InvalidPem { key_id: String, reason: String },

    #[error("signing key {key_id} is not a PKCS#8, PKCS#1 or SEC1 private key")]
    UnparseableKey { key_id: String },

    #[error("unsupported private key type: {0}")]
    UnsupportedKeyType(String),

    #[error("RSA signing key {key_id} is {bits} bits, at least {MIN_RSA_BITS} required")]
    WeakRsaKey { key_id: String, bits: usize },

    #[error("duplicate signing key id: {0}")]
    DuplicateKeyId(String),

    #[error("multiple keys exist but none are specified as active")]
    MultipleKeysNoActive,

    #[error("failed to prepare signing key {key_id}: {reason}")]
    Encoding { key_id: String, reason: String },
}

/// Decoded private key. The variant determines the JWS algorithm.
pub enum PrivateKey {
    Rsa(Box<RsaPrivateKey>),
    Ecdsa(p256::SecretKey),
}

impl PrivateKey {
    pub fn algorithm(&self) -> Algorithm {
        match self {
            PrivateKey::Rsa(_) => Algorithm::RS256,
            PrivateKey::Ecdsa(_) => Algorithm::ES256,
        }
    }
}

/// Public half of a key pair in JWK form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct PublicJwk {
    pub kty: String,
    #[serde(rename = "use")]
    pub use_field: String,
    pub alg: String,
    pub kid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
}

/// A loaded signing key pair.
pub struct KeyPair {
    key_id: String,
    is_active: bool,
    private_key: PrivateKey,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    public_jwk: PublicJwk,
}

impl KeyPair {
    /// Prepare a key pair from a decoded private key.
    pub fn new(
        key_id: impl Into<String>,
        private_key: PrivateKey,
        is_active: bool,
    ) -> Result<Self, KeyError> {
        let key_id = key_id.into();
        let encoding_failed = |reason: String| KeyError::Encoding {
            key_id: key_id.clone(),
            reason,
        };

        let (encoding_key, public_jwk) = match &private_key {
            PrivateKey::Rsa(key) => {
                let bits = key.size() * 8;
                if bits < MIN_RSA_BITS {
                    return Err(KeyError::WeakRsaKey {
                        key_id: key_id.clone(),
                        bits,
                    });
                }
                let der = key
                    .to_pkcs1_der()
                    .map_err(|e| encoding_failed(e.to_string()))?;
                let jwk = PublicJwk {
                    kty: "RSA".to_string(),
                    use_field: "sig".to_string(),
                    alg: "RS256".to_string(),
                    kid: key_id.clone(),
                    n: Some(Base64UrlUnpadded::encode_string(&key.n().to_bytes_be())),
                    e: Some(Base64UrlUnpadded::encode_string(&key.e().to_bytes_be())),
                    crv: None,
                    x: None,
                    y: None,
                };
                (EncodingKey::from_rsa_der(der.as_bytes()), jwk)
            }
            PrivateKey::Ecdsa(key) => {
                let der = key
                    .to_pkcs8_der()
                    .map_err(|e| encoding_failed(e.to_string()))?;
                let point = key.public_key().to_encoded_point(false);
                let (Some(x), Some(y)) = (point.x(), point.y()) else {
                    return Err(encoding_failed("public key is the identity point".to_string()));
                };
                let jwk = PublicJwk {
                    kty: "EC".to_string(),
                    use_field: "sig".to_string(),
                    alg: "ES256".to_string(),
                    kid: key_id.clone(),
                    n: None,
                    e: None,
                    crv: Some("P-256".to_string()),
                    x: Some(Base64UrlUnpadded::encode_string(x)),
                    y: Some(Base64UrlUnpadded::encode_string(y)),
                };
                (EncodingKey::from_ec_der(der.as_bytes()), jwk)
            }
        };

        let decoding_key = decoding_key_for(&public_jwk).map_err(encoding_failed)?;

        Ok(Self {
            key_id,
            is_active,
            private_key,
            encoding_key,
            decoding_key,
            public_jwk,
        })
    }

    /// Decode a PEM private key and prepare it.
    pub fn from_pem(key_id: &str, pem: &[u8], is_active: bool) -> Result<Self, KeyError> {
        let private_key = decode_private_key(key_id, pem)?;
        Self::new(key_id, private_key, is_active)
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn algorithm(&self) -> Algorithm {
        self.private_key.algorithm()
    }

    pub fn encoding_key(&self) -> &EncodingKey {
        &self.encoding_key
    }

    pub fn decoding_key(&self) -> &DecodingKey {
        &self.decoding_key
    }

    pub fn public_jwk(&self) -> &PublicJwk {
        &self.public_jwk
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("key_id", &self.key_id)
            .field("is_active", &self.is_active)
            .field("algorithm", &self.algorithm())
            .finish_non_exhaustive()
    }
}

fn decoding_key_for(jwk: &PublicJwk) -> Result<DecodingKey, String> {
    match (&jwk.n, &jwk.e, &jwk.x, &jwk.y) {
        (Some(n), Some(e), _, _) => {
            DecodingKey::from_rsa_components(n, e).map_err(|e| e.to_string())
        }
        (_, _, Some(x), Some(y)) => DecodingKey::from_ec_components(x, y).map_err(|e| e.to_string()),
        _ => Err("public key has no components".to_string()),
    }
}

/// Decode a PEM private key: PKCS#8, then PKCS#1, then SEC1.
pub fn decode_private_key(key_id: &str, pem: &[u8]) -> Result<PrivateKey, KeyError> {
    let block = pem::parse(pem).map_err(|e| KeyError::InvalidPem {
        key_id: key_id.to_string(),
        reason: e.to_string(),
    })?;
    let der = block.contents();

    if let Ok(info) = PrivateKeyInfo::try_from(der) {
        let oid = info.algorithm.oid;
        if oid == RSA_ENCRYPTION_OID {
            return RsaPrivateKey::from_pkcs8_der(der)
                .map(|key| PrivateKey::Rsa(Box::new(key)))
                .map_err(|_| KeyError::UnparseableKey {
                    key_id: key_id.to_string(),
                });
        }
        if oid == EC_PUBLIC_KEY_OID {
            return p256::SecretKey::from_pkcs8_der(der)
                .map(PrivateKey::Ecdsa)
                .map_err(|_| {
                    KeyError::UnsupportedKeyType("elliptic curve other than P-256".to_string())
                });
        }
        return Err(KeyError::UnsupportedKeyType(format!("algorithm {oid}")));
    }

    if let Ok(key) = RsaPrivateKey::from_pkcs1_der(der) {
        return Ok(PrivateKey::Rsa(Box::new(key)));
    }

    if let Ok(key) = p256::SecretKey::from_sec1_der(der) {
        return Ok(PrivateKey::Ecdsa(key));
    }

    Err(KeyError::UnparseableKey {
        key_id: key_id.to_string(),
    })
}

/// An immutable, cheaply clonable set of loaded key pairs.
#[derive(Clone, Default)]
pub struct KeyPairs {
    pairs: Arc<Vec<Arc<KeyPair>>>,
}

impl KeyPairs {
    pub fn new(pairs: Vec<KeyPair>) -> Self {
        Self::from_shared(pairs.into_iter().map(Arc::new).collect())
    }

    pub fn from_shared(pairs: Vec<Arc<KeyPair>>) -> Self {
        Self {
            pairs: Arc::new(pairs),
        }
    }

    /// The key used to sign new tokens.
    ///
    /// A single-member set is active regardless of its flag.
    pub fn active(&self) -> Option<&KeyPair> {
        if self.pairs.len() == 1 {
            return self.pairs.first().map(Arc::as_ref);
        }
        self.pairs.iter().map(Arc::as_ref).find(|pair| pair.is_active)
    }

    pub fn find(&self, key_id: &str) -> Option<&KeyPair> {
        self.pairs
            .iter()
            .map(Arc::as_ref)
            .find(|pair| pair.key_id == key_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyPair> {
        self.pairs.iter().map(Arc::as_ref)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl fmt::Debug for KeyPairs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.pairs.iter()).finish()
    }
}

/// Where a configured key's PEM comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    File(PathBuf),
    Inline(String),
}

/// A configured signing key reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySecret {
    pub key_id: String,
    pub source: KeySource,
}

impl KeySecret {
    fn read(&self) -> Result<Vec<u8>, KeyError> {
        match &self.source {
            KeySource::File(path) => std::fs::read(path).map_err(|source| KeyError::Io {
                key_id: self.key_id.clone(),
                source,
            }),
            KeySource::Inline(pem) => Ok(pem.as_bytes().to_vec()),
        }
    }
}

/// Key configuration.
#[derive(Debug, Clone, Default)]
pub struct KeySettings {
    pub secrets: Vec<KeySecret>,
    pub active_key: Option<String>,
    pub dev_mode: bool,
}

/// Owns key configuration and the per-process development key.
///
/// Created once at startup and shared by reference.
pub struct KeyManager {
    settings: KeySettings,
    started_at: DateTime<Utc>,
    dev_key: Mutex<Option<Arc<KeyPair>>>,
}

impl KeyManager {
    pub fn new(settings: KeySettings) -> Self {
        Self {
            settings,
            started_at: Utc::now(),
            dev_key: Mutex::new(None),
        }
    }

    /// Load every configured key, or fall back to the development key.
    ///
    /// Returns an empty set when nothing is configured outside development
    /// mode; authentication is then disabled.
    pub fn load_or_generate(&self) -> Result<KeyPairs, KeyError> {
        if self.settings.secrets.is_empty() {
            if self.settings.dev_mode {
                let key = self.dev_key()?;
                warn!(
                    key_id = %key.key_id(),
                    "Using ephemeral development signing key"
                );
                return Ok(KeyPairs::from_shared(vec![key]));
            }
            info!("No signing keys configured, authentication is disabled");
            return Ok(KeyPairs::default());
        }

        let hint = self.settings.active_key.as_deref();
        let mut pairs: Vec<KeyPair> = Vec::with_capacity(self.settings.secrets.len());
        for secret in &self.settings.secrets {
            if pairs.iter().any(|pair| pair.key_id == secret.key_id) {
                return Err(KeyError::DuplicateKeyId(secret.key_id.clone()));
            }
            let pem = secret.read()?;
            let is_active = hint == Some(secret.key_id.as_str());
            pairs.push(KeyPair::from_pem(&secret.key_id, &pem, is_active)?);
        }

        if let [only] = pairs.as_mut_slice() {
            only.is_active = true;
        } else if !pairs.iter().any(|pair| pair.is_active) {
            return Err(KeyError::MultipleKeysNoActive);
        }

        for pair in &pairs {
            info!(
                key_id = %pair.key_id,
                algorithm = ?pair.algorithm(),
                active = pair.is_active,
                "Loaded signing key"
            );
        }

        Ok(KeyPairs::new(pairs))
    }

    fn dev_key(&self) -> Result<Arc<KeyPair>, KeyError> {
        let mut slot = self.dev_key.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(key) = slot.as_ref() {
            return Ok(Arc::clone(key));
        }

        let key_id = format!("dev-{}", self.started_at.timestamp_millis());
        let secret = p256::SecretKey::random(&mut OsRng);
        let key = Arc::new(KeyPair::new(key_id, PrivateKey::Ecdsa(secret), true)?);
        *slot = Some(Arc::clone(&key));
        Ok(key)
    }
}
