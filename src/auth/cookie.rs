// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Session and OIDC state cookies.
//!
//! Every cookie is `HttpOnly; SameSite=Lax; Path=/` and gains `Secure` when
//! the request arrived over https (directly or behind a proxy that sets
//! `X-Forwarded-Proto`).

use axum::http::header::COOKIE;
use axum::http::{HeaderMap, Uri};
use base64ct::{Base64UrlUnpadded, Encoding};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Name of the cookie carrying the signed OIDC login state.
pub const OIDC_STATE_COOKIE: &str = "oidc_state";

/// Lifetime of the OIDC state cookie (10 minutes).
pub const OIDC_STATE_MAX_AGE: i64 = 600;

/// Build a `Set-Cookie` value.
pub fn build_set_cookie(name: &str, value: &str, max_age: i64, secure: bool) -> String {
    let mut cookie = format!("{name}={value}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age}");
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// Build a `Set-Cookie` value that removes the cookie.
pub fn build_clear_cookie(name: &str, secure: bool) -> String {
    build_set_cookie(name, "", 0, secure)
}

/// Read a cookie from every `Cookie` header on the request.
pub fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, value)| *key == name && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

/// Whether the request was made over https.
pub fn is_secure_request(headers: &HeaderMap, uri: &Uri, tls: bool) -> bool {
    tls || uri.scheme_str() == Some("https")
        || headers
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|proto| proto.eq_ignore_ascii_case("https"))
}

/// Keep only local return paths; anything else becomes `/`.
pub fn sanitize_return_path(path: Option<&str>) -> String {
    match path {
        Some(path)
            if path.starts_with('/')
                && !path.starts_with("//")
                && !path.starts_with("/\\")
                && !path.chars().any(char::is_control) =>
        {
            path.to_string()
        }
        _ => "/".to_string(),
    }
}

/// Payload of the OIDC state cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginState {
    pub state: String,
    pub return_to: String,
}

/// HMAC-SHA256 signer for the OIDC state cookie.
#[derive(Clone)]
pub struct StateSigner {
    mac: HmacSha256,
}

impl StateSigner {
    /// Derive a signing key distinct from other uses of `secret`.
    pub fn new(secret: &[u8]) -> Result<Self, hmac::digest::InvalidLength> {
        let key = Sha256::new()
            .chain_update(b"oidc_state.v1")
            .chain_update(secret)
            .finalize();
        Ok(Self {
            mac: HmacSha256::new_from_slice(&key)?,
        })
    }

    /// `base64url(json) "." base64url(mac)`
    pub fn sign(&self, state: &LoginState) -> Result<String, serde_json::Error> {
        let payload = Base64UrlUnpadded::encode_string(&serde_json::to_vec(state)?);
        let mut mac = self.mac.clone();
        mac.update(payload.as_bytes());
        let tag = Base64UrlUnpadded::encode_string(&mac.finalize().into_bytes());
        Ok(format!("{payload}.{tag}"))
    }

    /// Check the tag in constant time and decode the payload.
    pub fn verify(&self, value: &str) -> Option<LoginState> {
        let (payload, tag) = value.split_once('.')?;
        let tag = Base64UrlUnpadded::decode_vec(tag).ok()?;
        let mut mac = self.mac.clone();
        mac.update(payload.as_bytes());
        mac.verify_slice(&tag).ok()?;

        let json = Base64UrlUnpadded::decode_vec(payload).ok()?;
        serde_json::from_slice(&json).ok()
    }
}

impl std::fmt::Debug for StateSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateSigner").finish_non_exhaustive()
    }
}
