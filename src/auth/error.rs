// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Authentication and OAuth2 protocol errors.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use utoipa::ToSchema;

/// Token verification error type.
///
/// Returned by the verifier and surfaced by the middleware for header tokens.
#[derive(Debug)]
pub enum AuthError {
    /// Invalid authorization header format
    InvalidAuthHeader,
    /// Token is malformed
    MalformedToken,
    /// Token signature is invalid
    InvalidSignature,
    /// Token has expired
    TokenExpired,
    /// Token issuer is invalid
    InvalidIssuer,
    /// Token audience is invalid
    InvalidAudience,
    /// Token is not yet valid
    TokenNotYetValid,
    /// Token carries no subject
    MissingSubject,
    /// Token was signed with an algorithm the key does not use
    UnsupportedAlgorithm,
    /// No configured or published key matches the token
    NoMatchingKey,
    /// Upstream key set could not be fetched
    JwksFetchError(String),
    /// No authenticated caller
    AuthenticationRequired,
    /// Insufficient permissions
    InsufficientPermissions,
    /// Internal error
    InternalError(String),
}

#[derive(Serialize, ToSchema)]
pub struct AuthErrorBody {
    pub error: String,
    pub error_code: String,
}

impl AuthError {
    /// Get the error code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            AuthError::InvalidAuthHeader => "invalid_auth_header",
            AuthError::MalformedToken => "malformed_token",
            AuthError::InvalidSignature => "invalid_signature",
            AuthError::TokenExpired => "token_expired",
            AuthError::InvalidIssuer => "invalid_issuer",
            AuthError::InvalidAudience => "invalid_audience",
            AuthError::TokenNotYetValid => "token_not_yet_valid",
            AuthError::MissingSubject => "missing_subject",
            AuthError::UnsupportedAlgorithm => "unsupported_algorithm",
            AuthError::NoMatchingKey => "no_matching_key",
            AuthError::JwksFetchError(_) => "jwks_fetch_error",
            AuthError::AuthenticationRequired => "authentication_required",
            AuthError::InsufficientPermissions => "insufficient_permissions",
            AuthError::InternalError(_) => "internal_error",
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AuthError::InvalidAuthHeader
            | AuthError::MalformedToken
            | AuthError::InvalidSignature
            | AuthError::TokenExpired
            | AuthError::InvalidIssuer
            | AuthError::InvalidAudience
            | AuthError::TokenNotYetValid
            | AuthError::MissingSubject
            | AuthError::UnsupportedAlgorithm
            | AuthError::NoMatchingKey
            | AuthError::AuthenticationRequired => StatusCode::UNAUTHORIZED,
            AuthError::InsufficientPermissions => StatusCode::FORBIDDEN,
            AuthError::JwksFetchError(_) | AuthError::InternalError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::InvalidAuthHeader => {
                write!(f, "Invalid authorization header format (expected 'Bearer <token>')")
            }
            AuthError::MalformedToken => write!(f, "Token is malformed"),
            AuthError::InvalidSignature => write!(f, "Token signature is invalid"),
            AuthError::TokenExpired => write!(f, "Token has expired"),
            AuthError::InvalidIssuer => write!(f, "Token issuer is invalid"),
            AuthError::InvalidAudience => write!(f, "Token audience is invalid"),
            AuthError::TokenNotYetValid => write!(f, "Token is not yet valid"),
            AuthError::MissingSubject => write!(f, "Token has no subject"),
            AuthError::UnsupportedAlgorithm => write!(f, "Token algorithm is not accepted"),
            AuthError::NoMatchingKey => write!(f, "No matching signing key"),
            AuthError::JwksFetchError(msg) => write!(f, "Failed to fetch JWKS: {msg}"),
            AuthError::AuthenticationRequired => write!(f, "Authentication is required"),
            AuthError::InsufficientPermissions => {
                write!(f, "Insufficient permissions for this operation")
            }
            AuthError::InternalError(msg) => write!(f, "Internal authentication error: {msg}"),
        }
    }
}

impl std::error::Error for AuthError {}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match err.kind() {
            ErrorKind::ExpiredSignature => AuthError::TokenExpired,
            ErrorKind::InvalidIssuer => AuthError::InvalidIssuer,
            ErrorKind::InvalidAudience => AuthError::InvalidAudience,
            ErrorKind::ImmatureSignature => AuthError::TokenNotYetValid,
            ErrorKind::InvalidSignature => AuthError::InvalidSignature,
            ErrorKind::InvalidAlgorithm => AuthError::UnsupportedAlgorithm,
            ErrorKind::MissingRequiredClaim(claim) if claim == "sub" => AuthError::MissingSubject,
            _ => AuthError::MalformedToken,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(AuthErrorBody {
            error: self.to_string(),
            error_code: self.error_code().to_string(),
        });
        (status, body).into_response()
    }
}

/// RFC 6749 error response body.
#[derive(Debug, Serialize, ToSchema)]
pub struct OAuthErrorBody {
    pub error: String,
    pub error_description: String,
}

/// Error returned by the authorize and token endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthError {
    pub status: StatusCode,
    pub error: &'static str,
    pub description: String,
}

impl OAuthError {
    pub fn new(status: StatusCode, error: &'static str, description: impl Into<String>) -> Self {
        Self {
            status,
            error,
            description: description.into(),
        }
    }

    pub fn invalid_request(description: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", description)
    }

    pub fn invalid_client(description: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_client", description)
    }

    pub fn unsupported_grant_type(description: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "unsupported_grant_type", description)
    }

    pub fn unsupported_response_type(description: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "unsupported_response_type", description)
    }

    /// Grant types the engine knows about but does not implement.
    pub fn not_implemented(description: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_IMPLEMENTED, "unsupported_grant_type", description)
    }

    pub fn server_error(description: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "server_error", description)
    }
}

impl std::fmt::Display for OAuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error, self.description)
    }
}

impl std::error::Error for OAuthError {}

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        let body = Json(OAuthErrorBody {
            error: self.error.to_string(),
            error_description: self.description,
        });
        let mut response = (self.status, body).into_response();
        response
            .headers_mut()
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn invalid_header_returns_401() {
        let response = AuthError::InvalidAuthHeader.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let body_bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body_bytes).unwrap();
        assert_eq!(body["error_code"], "invalid_auth_header");
    }

    #[tokio::test]
    async fn insufficient_permissions_returns_403() {
        let response = AuthError::InsufficientPermissions.into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn jwt_errors_map_to_variants() {
        use jsonwebtoken::errors::{Error, ErrorKind};
        let expired: AuthError = Error::from(ErrorKind::ExpiredSignature).into();
        assert!(matches!(expired, AuthError::TokenExpired));
        let audience: AuthError = Error::from(ErrorKind::InvalidAudience).into();
        assert!(matches!(audience, AuthError::InvalidAudience));
        let garbage: AuthError = Error::from(ErrorKind::InvalidToken).into();
        assert!(matches!(garbage, AuthError::MalformedToken));
    }

    #[tokio::test]
    async fn oauth_error_is_rfc6749_shaped_and_not_cached() {
        let response = OAuthError::invalid_client("unknown client").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            "no-store"
        );

        let body_bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body_bytes).unwrap();
        assert_eq!(body["error"], "invalid_client");
        assert_eq!(body["error_description"], "unknown client");
    }

    #[test]
    fn refresh_token_style_errors_are_501() {
        let err = OAuthError::not_implemented("refresh_token is not supported");
        assert_eq!(err.status, StatusCode::NOT_IMPLEMENTED);
    }
}
