// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Authentication middleware for Axum.
//!
//! Wraps every route. For each request:
//!
//! - An `Authorization` header must be exactly `Bearer <token>`; a malformed
//!   header or a bad token is rejected with 401
//! - Otherwise the session cookie, if any, is the candidate token; a bad
//!   cookie is cleared and the browser is sent to `/` with 303
//! - With neither, the request continues anonymously
//!
//! On success the [`AuthContext`] is stored in request extensions, where the
//! extractors in `extractor.rs` read it without re-verifying.
//!
//! ```rust,ignore
//! let app = Router::new()
//!     .route("/protected", get(protected_handler))
//!     .layer(axum::middleware::from_fn_with_state(state.clone(), auth_middleware))
//!     .with_state(state);
//! ```

use axum::{
    extract::{Request, State},
    http::{
        header::{AUTHORIZATION, LOCATION, SET_COOKIE},
        HeaderValue, StatusCode,
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

use super::claims::{AuthContext, TokenSource};
use super::cookie::{build_clear_cookie, is_secure_request, read_cookie};
use super::AuthError;
use crate::state::AppState;

enum Outcome {
    Authenticated(AuthContext),
    Anonymous,
    Rejected(Response),
}

/// Authentication middleware function.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    if !state.engine.is_auth_enabled() {
        return next.run(request).await;
    }

    match authenticate(&state, &request) {
        Outcome::Authenticated(context) => {
            request.extensions_mut().insert(context);
        }
        Outcome::Anonymous => {}
        Outcome::Rejected(response) => return response,
    }

    next.run(request).await
}

fn authenticate(state: &AppState, request: &Request) -> Outcome {
    let headers = request.headers();

    if let Some(header) = headers.get(AUTHORIZATION) {
        let token = match bearer_token(header) {
            Ok(token) => token,
            Err(err) => return Outcome::Rejected(err.into_response()),
        };
        return match state.engine.authenticate(token, TokenSource::Header) {
            Ok(context) => Outcome::Authenticated(context),
            Err(err) => {
                warn!(
                    error = %err,
                    path = %request.uri().path(),
                    "Rejected bearer token"
                );
                Outcome::Rejected(err.into_response())
            }
        };
    }

    let Some(token) = read_cookie(headers, &state.settings.cookie_name) else {
        return Outcome::Anonymous;
    };

    match state.engine.authenticate(&token, TokenSource::Cookie) {
        Ok(context) => Outcome::Authenticated(context),
        Err(err) => {
            debug!(error = %err, "Clearing invalid session cookie");
            let secure = is_secure_request(headers, request.uri(), state.settings.tls.is_some());
            Outcome::Rejected(clear_session(&state.settings.cookie_name, secure))
        }
    }
}

/// Parse `Bearer <token>`; anything else is a malformed header.
fn bearer_token(header: &HeaderValue) -> Result<&str, AuthError> {
    let value = header.to_str().map_err(|_| AuthError::InvalidAuthHeader)?;
    match value.strip_prefix("Bearer ") {
        Some(token) if !token.is_empty() && !token.contains(char::is_whitespace) => Ok(token),
        _ => Err(AuthError::InvalidAuthHeader),
    }
}

/// 303 to `/` with the session cookie removed.
fn clear_session(cookie_name: &str, secure: bool) -> Response {
    (
        StatusCode::SEE_OTHER,
        [
            (LOCATION, "/".to_string()),
            (SET_COOKIE, build_clear_cookie(cookie_name, secure)),
        ],
    )
        .into_response()
}
