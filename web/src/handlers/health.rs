//! Health check endpoints.
//!
//! These endpoints are used by load balancers and orchestrators to decide
//! whether to route traffic to the service.

use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode};
use inventory_sync_core::dead_letter::DeadLetterStatus;
use serde::Serialize;

/// Simple health check endpoint (for basic liveness).
///
/// Does NOT check dependencies.
///
/// ```text
/// GET /health
/// ```
#[allow(clippy::unused_async)]
pub async fn health_check() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

/// Readiness report.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Readiness {
    /// `ready` or `not_ready`
    pub status: &'static str,
    /// Dead-letter entries awaiting automatic retry, when the store answered
    pub pending_dead_letters: Option<usize>,
    /// Dead-letter entries awaiting an operator, when the store answered
    pub escalated_dead_letters: Option<usize>,
}

/// Readiness check.
///
/// - 200 OK once startup finished and the dead-letter store answers
/// - 503 Service Unavailable otherwise
///
/// ```text
/// GET /ready
/// ```
pub async fn readiness_check(State(state): State<AppState>) -> (StatusCode, Json<Readiness>) {
    let pending = state
        .dead_letters
        .count(DeadLetterStatus::Pending)
        .await
        .inspect_err(|e| tracing::warn!(error = %e, "Dead-letter store not answering"))
        .ok();
    let escalated = state
        .dead_letters
        .count(DeadLetterStatus::Escalated)
        .await
        .ok();

    let ready = state.is_ready() && pending.is_some();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(Readiness {
            status: if ready { "ready" } else { "not_ready" },
            pending_dead_letters: pending,
            escalated_dead_letters: escalated,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simple_health_check() {
        let (status, body) = health_check().await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }
}
