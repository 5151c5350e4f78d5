// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use utoipa::ToSchema;

use crate::state::AppState;

/// Health check response with individual component status.
#[derive(Debug, Serialize, ToSchema)]
pub struct ReadyResponse {
    /// Overall health status ("ok" or "degraded").
    pub status: String,
    /// Individual health checks and their results.
    pub checks: HealthChecks,
}

/// Individual health check results.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthChecks {
    /// Whether the service process is running.
    pub service: String,
    /// Signing keys ("ok" or "disabled" when none are configured).
    pub signing_keys: String,
    /// Upstream OIDC key set. Only present when OIDC is configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oidc: Option<String>,
}

/// Simple health check response for liveness probes.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
}

/// Check that the upstream provider's keys are reachable.
async fn check_oidc(state: &AppState) -> Option<String> {
    let oidc = state.engine.exchanger().oidc()?;
    if oidc.keys_cached().await {
        return Some("ok".to_string());
    }
    match oidc.refresh_keys().await {
        Ok(()) => Some("ok".to_string()),
        Err(_) => Some("unavailable".to_string()),
    }
}

/// Health check endpoint handler.
///
/// Returns 200 if all checks pass, 503 if any check fails.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses(
        (status = 200, description = "Service is healthy", body = ReadyResponse),
        (status = 503, description = "Service is unhealthy", body = ReadyResponse)
    )
)]
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    let oidc = check_oidc(&state).await;
    let all_ok = oidc.as_deref().is_none_or(|s| s == "ok");

    let response = ReadyResponse {
        status: if all_ok { "ok" } else { "degraded" }.to_string(),
        checks: HealthChecks {
            service: "ok".to_string(),
            signing_keys: if state.engine.is_auth_enabled() {
                "ok"
            } else {
                "disabled"
            }
            .to_string(),
            oidc,
        },
    };

    let status = if all_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(response))
}

/// Liveness probe handler.
///
/// Always returns 200 if the process is running.
#[utoipa::path(
    get,
    path = "/health/live",
    tag = "Health",
    responses(
        (status = 200, description = "Service is alive", body = HealthResponse)
    )
)]
pub async fn liveness() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// Readiness probe handler.
///
/// Returns 200 only if all dependencies are available.
#[utoipa::path(
    get,
    path = "/health/ready",
    tag = "Health",
    responses(
        (status = 200, description = "Service is ready", body = ReadyResponse),
        (status = 503, description = "Service is not ready", body = ReadyResponse)
    )
)]
pub async fn readiness(state: State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    health(state).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[tokio::test]
    async fn reports_key_status() {
        let (status, Json(body)) = health(State(testutil::app_state())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.checks.signing_keys, "ok");
        assert!(body.checks.oidc.is_none());

        let (_, Json(body)) = readiness(State(testutil::disabled_app_state())).await;
        assert_eq!(body.status, "ok");
        assert_eq!(body.checks.signing_keys, "disabled");
    }

    #[tokio::test]
    async fn liveness_is_always_ok() {
        assert_eq!(liveness().await.0.status, "ok");
    }
}
