// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Proof Key for Code Exchange (RFC 7636).

use base64ct::{Base64UrlUnpadded, Encoding};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

pub const METHOD_S256: &str = "S256";
pub const METHOD_PLAIN: &str = "plain";

const MIN_VERIFIER_LEN: usize = 43;
const MAX_VERIFIER_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PkceError {
    #[error("code_verifier is required")]
    MissingVerifier,

    #[error("code_verifier must be {MIN_VERIFIER_LEN}-{MAX_VERIFIER_LEN} unreserved characters")]
    InvalidVerifier,

    #[error("unsupported code_challenge_method: {0}")]
    UnsupportedMethod(String),

    #[error("code_verifier does not match code_challenge")]
    Mismatch,
}

/// Normalize a requested challenge method; absent means `plain`.
pub fn normalize_method(method: Option<&str>) -> Result<&'static str, PkceError> {
    match method {
        None | Some("") | Some(METHOD_PLAIN) => Ok(METHOD_PLAIN),
        Some(METHOD_S256) => Ok(METHOD_S256),
        Some(other) => Err(PkceError::UnsupportedMethod(other.to_string())),
    }
}

/// Compute the challenge for `verifier` under `method`.
pub fn challenge(verifier: &str, method: &str) -> Result<String, PkceError> {
    match normalize_method(Some(method))? {
        METHOD_S256 => Ok(Base64UrlUnpadded::encode_string(&Sha256::digest(
            verifier.as_bytes(),
        ))),
        _ => Ok(verifier.to_string()),
    }
}

/// Check `verifier` against a stored challenge.
pub fn verify(
    code_challenge: &str,
    method: Option<&str>,
    verifier: Option<&str>,
) -> Result<(), PkceError> {
    let verifier = verifier
        .filter(|v| !v.is_empty())
        .ok_or(PkceError::MissingVerifier)?;
    if !is_valid_verifier(verifier) {
        return Err(PkceError::InvalidVerifier);
    }

    let method = normalize_method(method)?;
    let computed = challenge(verifier, method)?;
    if bool::from(computed.as_bytes().ct_eq(code_challenge.as_bytes())) {
        Ok(())
    } else {
        Err(PkceError::Mismatch)
    }
}

fn is_valid_verifier(verifier: &str) -> bool {
    (MIN_VERIFIER_LEN..=MAX_VERIFIER_LEN).contains(&verifier.len())
        && verifier
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~'))
}
