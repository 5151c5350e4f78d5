// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::auth::ExchangeError;

/// Error for the browser-facing routes, rendered as `{"error": ...}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_IMPLEMENTED, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

/// Only the caller-safe message crosses the boundary.
impl From<ExchangeError> for ApiError {
    fn from(err: ExchangeError) -> Self {
        Self::new(err.status_code(), err.public_message())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::code::CodecError;
    use axum::body::to_bytes;

    #[test]
    fn constructors_set_status_and_message() {
        let bad = ApiError::bad_request("bad");
        assert_eq!(bad.status, StatusCode::BAD_REQUEST);
        assert_eq!(bad.message, "bad");

        let unauth = ApiError::unauthorized("who");
        assert_eq!(unauth.status, StatusCode::UNAUTHORIZED);

        let missing = ApiError::not_implemented("later");
        assert_eq!(missing.status, StatusCode::NOT_IMPLEMENTED);

        let internal = ApiError::internal("oops");
        assert_eq!(internal.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(internal.message, "oops");
    }

    #[test]
    fn exchange_errors_hide_internal_detail() {
        let err = ApiError::from(ExchangeError::Code(CodecError::Decrypt));
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(!err.message.to_lowercase().contains("decrypt"));

        let err = ApiError::from(ExchangeError::InvalidCredentials);
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn into_response_returns_json_body() {
        let response = ApiError::bad_request("bad data").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body_bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = String::from_utf8(body_bytes.to_vec()).unwrap();
        assert_eq!(body, r#"{"error":"bad data"}"#);
    }
}
