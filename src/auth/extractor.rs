// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Axum extractors for the authentication context.
//!
//! The middleware has already verified the token; these only read what it
//! attached to the request.
//!
//! ```rust,ignore
//! async fn my_handler(Auth(context): Auth) -> impl IntoResponse {
//!     // context.subject is the verified caller
//! }
//! ```

use axum::{extract::FromRequestParts, http::request::Parts};

use super::claims::AuthContext;
use super::entitlements::SecurityRequirement;
use super::AuthError;

/// Extractor that requires an authenticated caller.
pub struct Auth(pub AuthContext);

impl<S: Send + Sync> FromRequestParts<S> for Auth {
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthContext>()
            .cloned()
            .map(Auth)
            .ok_or(AuthError::AuthenticationRequired)
    }
}

impl Auth {
    /// Reject with 403 unless the caller satisfies `requirements`.
    pub fn require(&self, requirements: &[SecurityRequirement]) -> Result<(), AuthError> {
        if self.0.satisfies(requirements) {
            Ok(())
        } else {
            Err(AuthError::InsufficientPermissions)
        }
    }
}

/// Optional authentication extractor.
///
/// Returns `None` for anonymous requests instead of rejecting.
pub struct OptionalAuth(pub Option<AuthContext>);

impl<S: Send + Sync> FromRequestParts<S> for OptionalAuth {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(OptionalAuth(parts.extensions.get::<AuthContext>().cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::claims::{ClaimSet, TokenSource};
    use crate::auth::entitlements::IDENTITY_SCHEME;
    use axum::http::Request;

    fn parts() -> Parts {
        Request::builder()
            .uri("/test")
            .body(())
            .unwrap()
            .into_parts()
            .0
    }

    fn context(scope: &str) -> AuthContext {
        let mut claims = ClaimSet::new();
        claims.insert("sub", "user_123");
        claims.insert("scope", scope);
        AuthContext::from_claims(claims, TokenSource::Header).unwrap()
    }

    #[tokio::test]
    async fn auth_requires_context() {
        let mut parts = parts();
        let result = Auth::from_request_parts(&mut parts, &()).await;
        assert!(matches!(result, Err(AuthError::AuthenticationRequired)));
    }

    #[tokio::test]
    async fn auth_reads_extensions() {
        let mut parts = parts();
        parts.extensions.insert(context("pages::read"));

        let Auth(context) = Auth::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(context.subject, "user_123");
    }

    #[tokio::test]
    async fn require_checks_requirements() {
        let mut parts = parts();
        parts.extensions.insert(context("pages::read"));
        let auth = Auth::from_request_parts(&mut parts, &()).await.unwrap();

        let readable = SecurityRequirement::from([(
            IDENTITY_SCHEME.to_string(),
            vec!["pages:home:read".to_string()],
        )]);
        let writable = SecurityRequirement::from([(
            IDENTITY_SCHEME.to_string(),
            vec!["pages:home:write".to_string()],
        )]);
        assert!(auth.require(&[readable]).is_ok());
        assert!(matches!(
            auth.require(&[writable]),
            Err(AuthError::InsufficientPermissions)
        ));
    }

    #[tokio::test]
    async fn optional_auth_never_rejects() {
        let mut parts = parts();
        let OptionalAuth(context) = OptionalAuth::from_request_parts(&mut parts, &())
            .await
            .unwrap();
        assert!(context.is_none());
    }
}
