//! Relational store of record.
//!
//! Existence of a relation row is the single source of truth for "is engaged";
//! the durable per-subject counters move only together with row changes,
//! inside the same transaction.

use crate::engagement::{
    EngagementKind, EngagementRecord, PageRequest, Page, PendingEvent, Subject, SubjectId, UserId,
};
use crate::error::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;

/// Outcome of applying a batch of events in one transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Relations created (counter incremented for each)
    pub inserted: u64,
    /// Relations removed (counter decremented for each)
    pub deleted: u64,
    /// Events that found the store already in the target state
    pub skipped: u64,
}

impl BatchOutcome {
    /// Total events processed.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.inserted + self.deleted + self.skipped
    }
}

/// Durable counters of one subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubjectCounters {
    /// Book id
    pub subject_id: SubjectId,
    /// Durable like count
    pub likes: i64,
    /// Durable favorite count
    pub favorites: i64,
}

/// Relational engagement store.
///
/// Implementations: `PostgresEngagementRepository`, `MockEngagementRepository`.
pub trait EngagementRepository: Send + Sync + 'static {
    /// Creation instant of the relation, if it exists.
    ///
    /// # Errors
    ///
    /// Returns [`EngagementError::Database`](crate::EngagementError::Database) on store failure.
    fn relation_since(
        &self,
        user_id: UserId,
        subject_id: SubjectId,
        kind: EngagementKind,
    ) -> impl Future<Output = Result<Option<DateTime<Utc>>>> + Send;

    /// Bulk existence check, one flag per subject in input order.
    ///
    /// # Errors
    ///
    /// Returns error on store failure.
    fn relations_exist(
        &self,
        user_id: UserId,
        subjects: &[SubjectId],
        kind: EngagementKind,
    ) -> impl Future<Output = Result<Vec<bool>>> + Send;

    /// All active relations of a user, used to warm the membership cache.
    ///
    /// # Errors
    ///
    /// Returns error on store failure.
    fn user_relations(
        &self,
        user_id: UserId,
        kind: EngagementKind,
    ) -> impl Future<Output = Result<Vec<(SubjectId, DateTime<Utc>)>>> + Send;

    /// Number of active relations on a subject.
    ///
    /// # Errors
    ///
    /// Returns error on store failure.
    fn count_active(
        &self,
        subject_id: SubjectId,
        kind: EngagementKind,
    ) -> impl Future<Output = Result<i64>> + Send;

    /// Apply one event synchronously (used when the log is unavailable).
    ///
    /// # Returns
    ///
    /// `true` if a row was inserted or deleted.
    ///
    /// # Errors
    ///
    /// Returns error on store failure.
    fn apply_direct(&self, event: &PendingEvent) -> impl Future<Output = Result<bool>> + Send;

    /// Apply a collapsed batch in a single transaction.
    ///
    /// Removals in `off` are applied before inserts in `on`; a pair present in
    /// both is a relation removed and created again inside the batch. Inserting
    /// an existing relation and deleting a missing one are no-ops; any other
    /// failure rolls back the whole batch.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails; nothing is applied in that case.
    fn apply_batch(
        &self,
        kind: EngagementKind,
        on: &[PendingEvent],
        off: &[PendingEvent],
    ) -> impl Future<Output = Result<BatchOutcome>> + Send;

    /// Active relations created in `[start, end)`, grouped by subject.
    ///
    /// # Errors
    ///
    /// Returns error on store failure.
    fn count_created_between(
        &self,
        kind: EngagementKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<(SubjectId, i64)>>> + Send;

    /// Details of the given subjects. Missing ids are omitted.
    ///
    /// # Errors
    ///
    /// Returns error on store failure.
    fn subjects(&self, ids: &[SubjectId]) -> impl Future<Output = Result<Vec<Subject>>> + Send;

    /// Durable counters of every subject.
    ///
    /// # Errors
    ///
    /// Returns error on store failure.
    fn subject_counters(&self) -> impl Future<Output = Result<Vec<SubjectCounters>>> + Send;

    /// A user's relations of one kind, newest first.
    ///
    /// # Errors
    ///
    /// Returns error on store failure.
    fn list_user_engagements(
        &self,
        user_id: UserId,
        kind: EngagementKind,
        page: PageRequest,
    ) -> impl Future<Output = Result<Page<EngagementRecord>>> + Send;
}

/// Key/value system configuration rows.
pub trait ConfigRepository: Send + Sync + 'static {
    /// Every configuration row.
    ///
    /// # Errors
    ///
    /// Returns error on store failure.
    fn load_all(&self) -> impl Future<Output = Result<HashMap<String, String>>> + Send;

    /// One configuration value.
    ///
    /// # Errors
    ///
    /// Returns error on store failure.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>>> + Send;

    /// Insert or replace a configuration value.
    ///
    /// # Errors
    ///
    /// Returns error on store failure.
    fn upsert(&self, key: &str, value: &str) -> impl Future<Output = Result<()>> + Send;
}
