//! Prometheus metrics for the engagement pipeline.
//!
//! Counters are recorded through the `metrics` facade; nothing is exported
//! until [`MetricsServer::start`] installs the Prometheus recorder. The
//! request layer serves [`MetricsServer::render`] on `/metrics`.
//!
//! # Example
//!
//! ```rust,no_run
//! use shelfmark_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new();
//! server.start()?;
//! println!("{}", server.render().unwrap_or_default());
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use shelfmark_core::{EngagementAction, EngagementKind, ErrorCategory};
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus recorder holder.
#[derive(Default, Clone)]
pub struct MetricsServer {
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a server with no recorder installed yet.
    #[must_use]
    pub const fn new() -> Self {
        Self { handle: None }
    }

    /// Describe all metrics and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed. A recorder
    /// that is already installed (tests) is tolerated.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!("Prometheus recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Render current metrics in Prometheus text format.
    ///
    /// Returns `None` if the recorder was not installed by this server.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

impl std::fmt::Debug for MetricsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsServer")
            .field("installed", &self.handle.is_some())
            .finish()
    }
}

fn register_metrics() {
    // Toggle engine
    describe_counter!("engagement_toggles_total", "Successful toggles by kind and action");
    describe_counter!("engagement_toggle_errors_total", "Failed toggles by error category");
    describe_counter!(
        "engagement_direct_writes_total",
        "Toggles recorded by a synchronous relational write instead of the log"
    );
    describe_histogram!("engagement_toggle_duration_seconds", "Toggle latency");

    // Pipeline
    describe_counter!("engagement_pipeline_batches_total", "Batches committed");
    describe_counter!("engagement_pipeline_batch_failures_total", "Batches rolled back");
    describe_counter!("engagement_pipeline_events_total", "Events applied by outcome");
    describe_counter!("engagement_pipeline_reclaimed_total", "Stale entries reclaimed");
    describe_counter!("engagement_pipeline_malformed_total", "Undecodable entries dropped");
    describe_counter!("engagement_pipeline_ack_failures_total", "Acknowledgements that failed");

    // Ranking
    describe_counter!("engagement_ranking_rebuilds_total", "Leaderboard rebuilds by outcome");
    describe_counter!(
        "engagement_ranking_degraded_total",
        "Ranking reads answered with an empty list"
    );
}

/// Toggle engine metrics recorder.
pub struct ToggleMetrics;

impl ToggleMetrics {
    /// Record a successful toggle.
    pub fn record_toggle(kind: EngagementKind, action: EngagementAction, duration: Duration) {
        counter!("engagement_toggles_total", "kind" => kind.as_str(), "action" => action.as_str())
            .increment(1);
        histogram!("engagement_toggle_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a failed toggle.
    pub fn record_error(category: ErrorCategory) {
        let category = match category {
            ErrorCategory::Contention => "contention",
            ErrorCategory::Unavailable => "unavailable",
            ErrorCategory::Invalid => "invalid",
            ErrorCategory::System => "system",
        };
        counter!("engagement_toggle_errors_total", "category" => category).increment(1);
    }

    /// Record a direct relational write.
    pub fn record_direct_write(kind: EngagementKind) {
        counter!("engagement_direct_writes_total", "kind" => kind.as_str()).increment(1);
    }
}

/// Pipeline metrics recorder.
pub struct PipelineMetrics;

impl PipelineMetrics {
    /// Record a committed batch.
    pub fn record_batch(kind: EngagementKind, inserted: u64, deleted: u64, skipped: u64) {
        counter!("engagement_pipeline_batches_total", "kind" => kind.as_str()).increment(1);
        counter!("engagement_pipeline_events_total", "kind" => kind.as_str(), "outcome" => "inserted")
            .increment(inserted);
        counter!("engagement_pipeline_events_total", "kind" => kind.as_str(), "outcome" => "deleted")
            .increment(deleted);
        counter!("engagement_pipeline_events_total", "kind" => kind.as_str(), "outcome" => "skipped")
            .increment(skipped);
    }

    /// Record a rolled-back batch.
    pub fn record_batch_failure(kind: EngagementKind) {
        counter!("engagement_pipeline_batch_failures_total", "kind" => kind.as_str()).increment(1);
    }

    /// Record reclaimed entries.
    pub fn record_reclaimed(kind: EngagementKind, count: usize) {
        counter!("engagement_pipeline_reclaimed_total", "kind" => kind.as_str())
            .increment(count as u64);
    }

    /// Record dropped entries.
    pub fn record_malformed(kind: EngagementKind, count: usize) {
        counter!("engagement_pipeline_malformed_total", "kind" => kind.as_str())
            .increment(count as u64);
    }

    /// Record an acknowledgement failure.
    pub fn record_ack_failure(kind: EngagementKind) {
        counter!("engagement_pipeline_ack_failures_total", "kind" => kind.as_str()).increment(1);
    }
}

/// Ranking engine metrics recorder.
pub struct RankingMetrics;

impl RankingMetrics {
    /// Record a rebuild attempt.
    pub fn record_rebuild(succeeded: bool) {
        let outcome = if succeeded { "ok" } else { "failed" };
        counter!("engagement_ranking_rebuilds_total", "outcome" => outcome).increment(1);
    }

    /// Record a degraded (empty) ranking response.
    pub fn record_degraded() {
        counter!("engagement_ranking_degraded_total").increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code
mod tests {
    use super::*;

    #[test]
    fn test_metrics_server_starts_once_or_tolerates_reinstall() {
        let mut server = MetricsServer::new();
        assert!(server.render().is_none());
        assert!(server.start().is_ok());

        ToggleMetrics::record_toggle(
            EngagementKind::Like,
            EngagementAction::On,
            Duration::from_millis(3),
        );
        PipelineMetrics::record_batch(EngagementKind::Like, 2, 1, 0);

        // Another test binary thread may own the recorder.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("engagement_toggles_total"));
            assert!(rendered.contains("engagement_pipeline_batches_total"));
        }
    }
}
