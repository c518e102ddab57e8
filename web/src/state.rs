//! Application state for Axum handlers.

use shelfmark_runtime::metrics::MetricsServer;
use shelfmark_runtime::{RankingEngine, ToggleEngine};

/// Application state shared across all HTTP handlers.
///
/// Generic over the fast store and relational repository so the same router
/// serves the Redis/Postgres deployment and the in-memory test setup.
pub struct AppState<S, R> {
    /// Toggle, status and listing operations.
    pub toggles: ToggleEngine<S, R>,
    /// Leaderboard reads and rebuilds.
    pub rankings: RankingEngine<S, R>,
    /// Prometheus recorder rendered on `/metrics`.
    pub metrics: MetricsServer,
}

impl<S, R> AppState<S, R> {
    /// Create application state from the engines.
    #[must_use]
    pub const fn new(
        toggles: ToggleEngine<S, R>,
        rankings: RankingEngine<S, R>,
        metrics: MetricsServer,
    ) -> Self {
        Self {
            toggles,
            rankings,
            metrics,
        }
    }
}

impl<S, R> Clone for AppState<S, R> {
    fn clone(&self) -> Self {
        Self {
            toggles: self.toggles.clone(),
            rankings: self.rankings.clone(),
            metrics: self.metrics.clone(),
        }
    }
}
