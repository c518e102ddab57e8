//! Router composition.

use crate::handlers::{engagement, health, ranking};
use crate::state::AppState;
use axum::{
    Router,
    routing::{get, post},
};
use shelfmark_core::{EngagementRepository, FastStore};
use tower_http::trace::TraceLayer;

/// Create the engagement router.
///
/// # Routes
///
/// ## Engagement (`{kind}` is `likes` or `favorites`)
/// - `POST /api/v1/{kind}/{book_id}/toggle` - Flip the caller's state
/// - `GET /api/v1/{kind}/{book_id}/status` - Caller's state and count
/// - `POST /api/v1/{kind}/batch-status` - State and count for many books
/// - `GET /api/v1/{kind}/mine` - Caller's books, newest first
///
/// ## Rankings
/// - `GET /api/v1/rankings?type&period&limit` - Current leaderboard
/// - `POST /api/v1/rankings/rebuild` - Rebuild every current leaderboard
///
/// ## Operations
/// - `GET /health` - Liveness
/// - `GET /metrics` - Prometheus metrics
///
/// # Example
///
/// ```rust,ignore
/// let state = AppState::new(toggles, rankings, metrics);
/// let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
/// axum::serve(listener, router(state)).await?;
/// ```
pub fn router<S: FastStore, R: EngagementRepository>(state: AppState<S, R>) -> Router {
    Router::new()
        // Engagement
        .route("/api/v1/:kind/:book_id/toggle", post(engagement::toggle::<S, R>))
        .route("/api/v1/:kind/:book_id/status", get(engagement::status::<S, R>))
        .route("/api/v1/:kind/batch-status", post(engagement::batch_status::<S, R>))
        .route("/api/v1/:kind/mine", get(engagement::mine::<S, R>))
        // Rankings
        .route("/api/v1/rankings", get(ranking::ranking::<S, R>))
        .route("/api/v1/rankings/rebuild", post(ranking::rebuild::<S, R>))
        // Operations
        .route("/health", get(health::health_check))
        .route("/metrics", get(health::metrics::<S, R>))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
