//! Fast store abstraction: membership cache, counters, leaderboards, event log and locks.
//!
//! The fast store is the low-latency side of the pipeline. Everything it holds
//! can be rebuilt from the relational store, except pending log entries.
//!
//! # Implementation Notes
//!
//! - Every mutating operation must be a single atomic primitive (one command,
//!   one transaction, or one server-side script).
//! - A cache miss is reported as [`Cached::Miss`], never as "not engaged" or zero.
//! - Connectivity failures surface as [`EngagementError::FastStore`](crate::EngagementError::FastStore).

use crate::engagement::{EngagementKind, PendingEvent, SubjectId, UserId};
use crate::error::Result;
use crate::period::LeaderboardKey;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

/// Result of a cache read that may miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cached<T> {
    /// The cache holds the value.
    Hit(T),
    /// The cache does not know; consult the relational store.
    Miss,
}

impl<T> Cached<T> {
    /// Convert to `Option`, mapping `Miss` to `None`.
    pub fn hit(self) -> Option<T> {
        match self {
            Self::Hit(value) => Some(value),
            Self::Miss => None,
        }
    }

    /// Returns `true` for `Miss`.
    pub const fn is_miss(&self) -> bool {
        matches!(self, Self::Miss)
    }
}

/// Both cached counters of one subject. `None` means the field is not cached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CachedCounts {
    /// Cached like count
    pub likes: Option<i64>,
    /// Cached favorite count
    pub favorites: Option<i64>,
}

impl CachedCounts {
    /// Cached count of the given kind.
    #[must_use]
    pub const fn get(&self, kind: EngagementKind) -> Option<i64> {
        match kind {
            EngagementKind::Like => self.likes,
            EngagementKind::Favorite => self.favorites,
        }
    }
}

/// A short-lived mutual-exclusion lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockKey {
    /// Serializes toggles of one (user, subject, kind).
    Toggle {
        /// Toggling user
        user_id: UserId,
        /// Toggled subject
        subject_id: SubjectId,
        /// Like or favorite
        kind: EngagementKind,
    },
    /// Serializes rebuilds of one leaderboard.
    Rebuild(LeaderboardKey),
}

/// One entry read from the event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Log-assigned entry id, used for acknowledgement
    pub id: String,
    /// Raw entry fields
    pub fields: HashMap<String, String>,
}

/// Fast store operations used by the engines.
///
/// Implementations: `RedisFastStore` (production), `MockFastStore` (tests).
pub trait FastStore: Send + Sync + 'static {
    /// Consumer handle with its own connection.
    type Consumer: LogConsumer + 'static;

    /// Acquire a lock without waiting.
    ///
    /// # Returns
    ///
    /// `true` if the lock was acquired, `false` if someone else holds it.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable.
    fn try_lock(
        &self,
        key: &LockKey,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Release a lock unconditionally.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable.
    fn unlock(&self, key: &LockKey) -> impl Future<Output = Result<()>> + Send;

    /// Look up a relation in the user's cached membership set.
    ///
    /// # Returns
    ///
    /// - `Hit(Some(created_at))` if engaged
    /// - `Hit(None)` if the set is cached and does not contain the subject
    /// - `Miss` if the user's set is not cached
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable.
    fn engaged_since(
        &self,
        user_id: UserId,
        subject_id: SubjectId,
        kind: EngagementKind,
    ) -> impl Future<Output = Result<Cached<Option<DateTime<Utc>>>>> + Send;

    /// Bulk membership test, one flag per subject in input order.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable.
    fn engaged_batch(
        &self,
        user_id: UserId,
        subjects: &[SubjectId],
        kind: EngagementKind,
    ) -> impl Future<Output = Result<Cached<Vec<bool>>>> + Send;

    /// Replace the user's cached membership set with `relations` and mark it warm.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable.
    fn warm_engagements(
        &self,
        user_id: UserId,
        kind: EngagementKind,
        relations: &[(SubjectId, DateTime<Utc>)],
        ttl: Duration,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Add a relation to the user's set and refresh its TTL.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable.
    fn add_engagement(
        &self,
        user_id: UserId,
        subject_id: SubjectId,
        kind: EngagementKind,
        created_at: DateTime<Utc>,
        ttl: Duration,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Remove a relation from the user's set and refresh its TTL.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable.
    fn remove_engagement(
        &self,
        user_id: UserId,
        subject_id: SubjectId,
        kind: EngagementKind,
        ttl: Duration,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Drop the user's cached membership set so the next read falls back to
    /// the relational store.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable.
    fn forget_engagements(
        &self,
        user_id: UserId,
        kind: EngagementKind,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Add `delta` to a cached counter, only if the counter is cached.
    ///
    /// # Returns
    ///
    /// `Hit(new_value)` or `Miss` if the counter was not cached (nothing written).
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable.
    fn incr_count(
        &self,
        subject_id: SubjectId,
        kind: EngagementKind,
        delta: i64,
        ttl: Duration,
    ) -> impl Future<Output = Result<Cached<i64>>> + Send;

    /// Read both cached counters of a subject and refresh their TTL.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable.
    fn counts(
        &self,
        subject_id: SubjectId,
        ttl: Duration,
    ) -> impl Future<Output = Result<CachedCounts>> + Send;

    /// Seed a counter from the relational store unless it is already cached.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable.
    fn seed_count(
        &self,
        subject_id: SubjectId,
        kind: EngagementKind,
        value: i64,
        ttl: Duration,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Drop one cached counter so the next read reseeds it from the relational store.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable.
    fn forget_count(
        &self,
        subject_id: SubjectId,
        kind: EngagementKind,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Add `delta` to a subject's leaderboard score, only if the board exists.
    ///
    /// # Returns
    ///
    /// `true` if the board existed and was updated. A missing board is left
    /// missing so the next read rebuilds it completely.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable.
    fn incr_score(
        &self,
        board: &LeaderboardKey,
        subject_id: SubjectId,
        delta: i64,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Highest-scoring entries of a board with a positive score, best first.
    /// Equal scores are ordered by ascending subject id.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable.
    fn top_scores(
        &self,
        board: &LeaderboardKey,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<(SubjectId, i64)>>> + Send;

    /// Atomically replace a board's contents and set its TTL.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable.
    fn replace_leaderboard(
        &self,
        board: &LeaderboardKey,
        entries: &[(SubjectId, i64)],
        ttl: Duration,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Append an event to its kind's log.
    ///
    /// # Returns
    ///
    /// The log-assigned entry id.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable.
    fn append_event(&self, event: &PendingEvent) -> impl Future<Output = Result<String>> + Send;

    /// Create the consumer group on a kind's log if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable.
    fn ensure_group(
        &self,
        kind: EngagementKind,
        group: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Open a consumer on a kind's log.
    ///
    /// # Errors
    ///
    /// Returns error if the consumer connection cannot be established.
    fn consumer(
        &self,
        kind: EngagementKind,
        group: &str,
        name: &str,
    ) -> impl Future<Output = Result<Self::Consumer>> + Send;
}

/// A named member of a consumer group.
///
/// Entries delivered to a consumer stay pending until acknowledged. Pending
/// entries idle longer than a threshold can be claimed by any consumer.
/// Workers hold a consumer across awaits inside supervised tasks, so it must
/// be shareable between threads.
pub trait LogConsumer: Send + Sync {
    /// Consumer name within its group.
    fn name(&self) -> &str;

    /// Read up to `count` never-delivered entries, blocking up to `block`.
    ///
    /// # Returns
    ///
    /// An empty vector on timeout.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable.
    fn read_new(
        &mut self,
        count: usize,
        block: Duration,
    ) -> impl Future<Output = Result<Vec<LogEntry>>> + Send;

    /// Claim up to `count` entries pending longer than `min_idle` on any consumer.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable.
    fn claim_stale(
        &mut self,
        min_idle: Duration,
        count: usize,
    ) -> impl Future<Output = Result<Vec<LogEntry>>> + Send;

    /// Acknowledge entries.
    ///
    /// # Returns
    ///
    /// Number of entries that were pending and are now acknowledged.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable.
    fn ack(&mut self, ids: &[String]) -> impl Future<Output = Result<u64>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cached_hit() {
        assert_eq!(Cached::Hit(3).hit(), Some(3));
        assert_eq!(Cached::<i64>::Miss.hit(), None);
        assert!(Cached::<i64>::Miss.is_miss());
    }

    #[test]
    fn test_cached_counts_by_kind() {
        let counts = CachedCounts {
            likes: Some(4),
            favorites: None,
        };
        assert_eq!(counts.get(EngagementKind::Like), Some(4));
        assert_eq!(counts.get(EngagementKind::Favorite), None);
    }
}
