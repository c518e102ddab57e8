//! Liveness and metrics endpoints.

use crate::state::AppState;
use axum::{extract::State, http::StatusCode};

/// Simple liveness check.
///
/// Does not touch Redis or Postgres: toggles and reads degrade on their own
/// when a backing store is down.
///
/// # Endpoint
///
/// ```text
/// GET /health
/// ```
#[allow(clippy::unused_async)]
pub async fn health_check() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

/// Prometheus text exposition.
///
/// # Endpoint
///
/// ```text
/// GET /metrics
/// ```
///
/// Returns 503 when no recorder was installed.
#[allow(clippy::unused_async)]
pub async fn metrics<S, R>(State(state): State<AppState<S, R>>) -> (StatusCode, String) {
    match state.metrics.render() {
        Some(body) => (StatusCode::OK, body),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics recorder not installed".to_string(),
        ),
    }
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
