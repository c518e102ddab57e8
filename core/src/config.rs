//! Engagement pipeline configuration.
//!
//! Every tunable of the toggle engine, the reconciliation pipeline and the
//! ranking engine lives here. Values come from the application (see the
//! server's `Config::from_env`); the defaults match production.

use crate::period::PeriodType;
use std::time::Duration;

/// Tunables shared by the engines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngagementConfig {
    /// Per-(user, subject, kind) toggle lock TTL.
    ///
    /// Default: 1 second
    pub lock_ttl: Duration,

    /// TTL of cached per-subject counters, refreshed on access.
    ///
    /// Default: 1 hour
    pub counter_ttl: Duration,

    /// TTL of a user's cached membership set.
    ///
    /// Default: 24 hours
    pub user_set_ttl: Duration,

    /// TTL of weekly leaderboards.
    ///
    /// Default: 8 days
    pub week_board_ttl: Duration,

    /// TTL of monthly leaderboards.
    ///
    /// Default: 35 days
    pub month_board_ttl: Duration,

    /// Lock TTL guarding a leaderboard rebuild.
    ///
    /// Default: 30 seconds
    pub rebuild_lock_ttl: Duration,

    /// Maximum entries read per pipeline batch.
    ///
    /// Default: 100
    pub batch_size: usize,

    /// How long a pipeline read blocks waiting for new entries.
    ///
    /// Default: 1 second
    pub block_timeout: Duration,

    /// Idle time after which an unacknowledged entry is reclaimed by another worker.
    ///
    /// Default: 30 seconds
    pub pending_timeout: Duration,

    /// Pipeline workers per engagement kind.
    ///
    /// Default: 2
    pub workers_per_kind: usize,

    /// Consumer group shared by pipeline workers.
    ///
    /// Default: `sync-group`
    pub consumer_group: String,

    /// Interval between scheduled full leaderboard rebuilds.
    ///
    /// Default: 1 hour
    pub rebuild_interval: Duration,

    /// Ranking size when the caller does not give one (also the maximum).
    ///
    /// Default: 100
    pub max_ranking_limit: usize,
}

impl EngagementConfig {
    /// Create configuration with production defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set toggle lock TTL.
    #[must_use]
    pub const fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Set cached counter TTL.
    #[must_use]
    pub const fn with_counter_ttl(mut self, ttl: Duration) -> Self {
        self.counter_ttl = ttl;
        self
    }

    /// Set cached membership set TTL.
    #[must_use]
    pub const fn with_user_set_ttl(mut self, ttl: Duration) -> Self {
        self.user_set_ttl = ttl;
        self
    }

    /// Set leaderboard TTLs.
    #[must_use]
    pub const fn with_board_ttls(mut self, week: Duration, month: Duration) -> Self {
        self.week_board_ttl = week;
        self.month_board_ttl = month;
        self
    }

    /// Set pipeline batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set pipeline block timeout.
    #[must_use]
    pub const fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }

    /// Set idle time before pending entries are reclaimed.
    #[must_use]
    pub const fn with_pending_timeout(mut self, timeout: Duration) -> Self {
        self.pending_timeout = timeout;
        self
    }

    /// Set pipeline workers per kind.
    #[must_use]
    pub const fn with_workers_per_kind(mut self, workers: usize) -> Self {
        self.workers_per_kind = workers;
        self
    }

    /// Set the consumer group name.
    #[must_use]
    pub fn with_consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = group.into();
        self
    }

    /// Set the scheduled rebuild interval.
    #[must_use]
    pub const fn with_rebuild_interval(mut self, interval: Duration) -> Self {
        self.rebuild_interval = interval;
        self
    }

    /// TTL for leaderboards of the given period type.
    #[must_use]
    pub const fn board_ttl(&self, period_type: PeriodType) -> Duration {
        match period_type {
            PeriodType::Week => self.week_board_ttl,
            PeriodType::Month => self.month_board_ttl,
        }
    }

    /// Clamp a requested ranking size to `1..=max_ranking_limit`.
    ///
    /// `None` and `0` both mean "the maximum".
    #[must_use]
    pub fn clamp_limit(&self, requested: Option<usize>) -> usize {
        match requested {
            None | Some(0) => self.max_ranking_limit,
            Some(limit) => limit.min(self.max_ranking_limit),
        }
    }
}

impl Default for EngagementConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(1),
            counter_ttl: Duration::from_secs(60 * 60),
            user_set_ttl: Duration::from_secs(24 * 60 * 60),
            week_board_ttl: Duration::from_secs(8 * 24 * 60 * 60),
            month_board_ttl: Duration::from_secs(35 * 24 * 60 * 60),
            rebuild_lock_ttl: Duration::from_secs(30),
            batch_size: 100,
            block_timeout: Duration::from_secs(1),
            pending_timeout: Duration::from_secs(30),
            workers_per_kind: 2,
            consumer_group: "sync-group".to_string(),
            rebuild_interval: Duration::from_secs(60 * 60),
            max_ranking_limit: 100,
        }
    }
}
