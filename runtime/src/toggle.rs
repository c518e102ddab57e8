//! Engagement toggle engine.
//!
//! A toggle flips one user's like/favorite on one subject. The fast path
//! updates the cache, counters and current leaderboards, then appends an event
//! for the reconciliation pipeline. When the log cannot take the event, or the
//! fast store is down altogether, the change is written straight to the
//! relational store instead.
//!
//! ```text
//! lock ─▶ read state ─▶ flip cache + counter ─▶ boards ─▶ append ─▶ unlock
//!            │ (store down)        │ (failure)              │ (failure)
//!            ▼                     ▼                        ▼
//!      relational read ───────▶ direct write ◀──── reverse fast path
//! ```

use crate::metrics::ToggleMetrics;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use shelfmark_core::environment::Clock;
use shelfmark_core::{
    Cached, EngagementAction, EngagementConfig, EngagementError, EngagementKind, EngagementRecord,
    EngagementRepository, EngagementStatus, FastStore, LeaderboardKey, LockKey, Page, PageRequest,
    PendingEvent, Period, PeriodType, Result, SubjectCounters, SubjectId, SubjectStatus, UserId,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// What the fast path changed, so it can be undone.
#[derive(Debug)]
struct FastPath {
    counter: Cached<i64>,
    boards: Vec<LeaderboardKey>,
}

/// Per-(user, subject, kind) engagement state machine.
pub struct ToggleEngine<S, R> {
    store: Arc<S>,
    repo: Arc<R>,
    clock: Arc<dyn Clock>,
    config: EngagementConfig,
}

impl<S, R> Clone for ToggleEngine<S, R> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            repo: Arc::clone(&self.repo),
            clock: Arc::clone(&self.clock),
            config: self.config.clone(),
        }
    }
}

impl<S: FastStore, R: EngagementRepository> ToggleEngine<S, R> {
    /// Create an engine over the given stores.
    #[must_use]
    pub fn new(
        store: Arc<S>,
        repo: Arc<R>,
        clock: Arc<dyn Clock>,
        config: EngagementConfig,
    ) -> Self {
        Self {
            store,
            repo,
            clock,
            config,
        }
    }

    /// Flip the user's engagement on a subject.
    ///
    /// # Returns
    ///
    /// The new state and the best-available aggregate count.
    ///
    /// # Errors
    ///
    /// - [`EngagementError::TooFrequent`] if another toggle on the same key is in flight
    /// - [`EngagementError::Database`] if the state could not be read from either store
    /// - [`EngagementError::Durability`] if neither the log nor the relational store took the change
    pub async fn toggle(
        &self,
        user_id: UserId,
        subject_id: SubjectId,
        kind: EngagementKind,
    ) -> Result<EngagementStatus> {
        let started = Instant::now();
        let lock = LockKey::Toggle {
            user_id,
            subject_id,
            kind,
        };

        let locked = match self.store.try_lock(&lock, self.config.lock_ttl).await {
            Ok(true) => true,
            Ok(false) => {
                debug!(user_id = %user_id, subject_id = %subject_id, kind = %kind, "Toggle rejected, lock held");
                ToggleMetrics::record_error(EngagementError::TooFrequent.category());
                return Err(EngagementError::TooFrequent);
            }
            Err(e) => {
                warn!(
                    user_id = %user_id,
                    subject_id = %subject_id,
                    kind = %kind,
                    error = %e,
                    "Toggle lock unavailable, continuing on the relational path"
                );
                false
            }
        };

        let result = self.toggle_locked(user_id, subject_id, kind, locked).await;

        if locked {
            if let Err(e) = self.store.unlock(&lock).await {
                warn!(user_id = %user_id, subject_id = %subject_id, error = %e, "Failed to release toggle lock");
            }
        }

        match result {
            Ok((status, action)) => {
                ToggleMetrics::record_toggle(kind, action, started.elapsed());
                Ok(status)
            }
            Err(e) => {
                ToggleMetrics::record_error(e.category());
                Err(e)
            }
        }
    }

    async fn toggle_locked(
        &self,
        user_id: UserId,
        subject_id: SubjectId,
        kind: EngagementKind,
        cache_usable: bool,
    ) -> Result<(EngagementStatus, EngagementAction)> {
        let (engaged_since, cache_usable) = self
            .current_state(user_id, subject_id, kind, cache_usable)
            .await?;

        let action = if engaged_since.is_some() {
            EngagementAction::Off
        } else {
            EngagementAction::On
        };
        let event = PendingEvent::new(user_id, subject_id, kind, action, self.clock.now());
        let engaged = action == EngagementAction::On;

        if cache_usable {
            match self.apply_fast_path(&event, engaged_since).await {
                Ok(fast) => match self.store.append_event(&event).await {
                    Ok(entry_id) => {
                        debug!(
                            user_id = %user_id,
                            subject_id = %subject_id,
                            kind = %kind,
                            action = event.action.as_str(),
                            entry_id = %entry_id,
                            "Toggle recorded"
                        );
                        let count = self.count_after_toggle(&event, fast.counter).await?;
                        return Ok((EngagementStatus { engaged, count }, action));
                    }
                    Err(e) => {
                        warn!(
                            user_id = %user_id,
                            subject_id = %subject_id,
                            kind = %kind,
                            error = %e,
                            "Failed to append engagement event, reversing fast path"
                        );
                        self.reverse_fast_path(&event, engaged_since, &fast).await;
                    }
                },
                Err(e) => {
                    warn!(
                        user_id = %user_id,
                        subject_id = %subject_id,
                        kind = %kind,
                        error = %e,
                        "Fast path failed, writing directly"
                    );
                }
            }
        }

        let count = self.write_direct(&event, cache_usable).await?;
        Ok((EngagementStatus { engaged, count }, action))
    }

    /// Current relation, plus whether the fast store answered.
    async fn current_state(
        &self,
        user_id: UserId,
        subject_id: SubjectId,
        kind: EngagementKind,
        try_cache: bool,
    ) -> Result<(Option<DateTime<Utc>>, bool)> {
        if try_cache {
            match self.store.engaged_since(user_id, subject_id, kind).await {
                Ok(Cached::Hit(since)) => return Ok((since, true)),
                Ok(Cached::Miss) => {
                    let relations = self.warm_user(user_id, kind).await?;
                    let since = relations
                        .iter()
                        .find(|(id, _)| *id == subject_id)
                        .map(|(_, at)| *at);
                    return Ok((since, true));
                }
                Err(e) => {
                    warn!(user_id = %user_id, kind = %kind, error = %e, "Fast store unavailable, reading relational state");
                }
            }
        }
        let since = self.repo.relation_since(user_id, subject_id, kind).await?;
        Ok((since, false))
    }

    /// Load a user's relations and cache them. Cache failures are logged.
    async fn warm_user(
        &self,
        user_id: UserId,
        kind: EngagementKind,
    ) -> Result<Vec<(SubjectId, DateTime<Utc>)>> {
        let relations = self.repo.user_relations(user_id, kind).await?;
        match self
            .store
            .warm_engagements(user_id, kind, &relations, self.config.user_set_ttl)
            .await
        {
            Ok(()) => debug!(user_id = %user_id, kind = %kind, relations = relations.len(), "Warmed membership cache"),
            Err(e) => warn!(user_id = %user_id, kind = %kind, error = %e, "Failed to warm membership cache"),
        }
        Ok(relations)
    }

    async fn apply_fast_path(
        &self,
        event: &PendingEvent,
        engaged_since: Option<DateTime<Utc>>,
    ) -> Result<FastPath> {
        self.set_membership(event, event.action).await?;

        let counter = match self
            .store
            .incr_count(event.subject_id, event.kind, event.action.delta(), self.config.counter_ttl)
            .await
        {
            Ok(counter) => counter,
            Err(e) => {
                self.restore_membership(event, engaged_since).await;
                return Err(e);
            }
        };

        let boards = self.apply_board_deltas(event, engaged_since).await;
        Ok(FastPath { counter, boards })
    }

    async fn set_membership(&self, event: &PendingEvent, action: EngagementAction) -> Result<()> {
        let ttl = self.config.user_set_ttl;
        match action {
            EngagementAction::On => {
                self.store
                    .add_engagement(event.user_id, event.subject_id, event.kind, event.timestamp, ttl)
                    .await
            }
            EngagementAction::Off => {
                self.store
                    .remove_engagement(event.user_id, event.subject_id, event.kind, ttl)
                    .await
            }
        }
    }

    async fn restore_membership(&self, event: &PendingEvent, engaged_since: Option<DateTime<Utc>>) {
        let ttl = self.config.user_set_ttl;
        let restored = match engaged_since {
            Some(created_at) => {
                self.store
                    .add_engagement(event.user_id, event.subject_id, event.kind, created_at, ttl)
                    .await
            }
            None => {
                self.store
                    .remove_engagement(event.user_id, event.subject_id, event.kind, ttl)
                    .await
            }
        };
        if let Err(e) = restored {
            warn!(user_id = %event.user_id, subject_id = %event.subject_id, error = %e, "Failed to restore cached membership");
        }
    }

    /// Apply the toggle to the current week and month boards.
    ///
    /// Removing a relation only lowers boards whose window contains the
    /// relation's creation, matching what a rebuild would count.
    async fn apply_board_deltas(
        &self,
        event: &PendingEvent,
        engaged_since: Option<DateTime<Utc>>,
    ) -> Vec<LeaderboardKey> {
        let mut applied = Vec::new();
        for period_type in PeriodType::ALL {
            let period = match Period::containing(period_type, event.timestamp) {
                Ok(period) => period,
                Err(e) => {
                    warn!(error = %e, "Failed to compute period");
                    continue;
                }
            };
            if event.action == EngagementAction::Off
                && !engaged_since.is_some_and(|created_at| period.contains(created_at))
            {
                continue;
            }

            let board = LeaderboardKey::for_period(event.kind, &period);
            match self
                .store
                .incr_score(&board, event.subject_id, event.action.delta(), self.config.board_ttl(period_type))
                .await
            {
                Ok(true) => applied.push(board),
                Ok(false) => debug!(board = %board, "Leaderboard not built yet, skipping delta"),
                Err(e) => warn!(board = %board, subject_id = %event.subject_id, error = %e, "Failed to update leaderboard"),
            }
        }
        applied
    }

    async fn reverse_fast_path(
        &self,
        event: &PendingEvent,
        engaged_since: Option<DateTime<Utc>>,
        fast: &FastPath,
    ) {
        self.restore_membership(event, engaged_since).await;

        if let Cached::Hit(_) = fast.counter {
            if let Err(e) = self
                .store
                .incr_count(event.subject_id, event.kind, -event.action.delta(), self.config.counter_ttl)
                .await
            {
                warn!(subject_id = %event.subject_id, error = %e, "Failed to reverse cached counter");
            }
        }

        for board in &fast.boards {
            if let Err(e) = self
                .store
                .incr_score(board, event.subject_id, -event.action.delta(), self.config.board_ttl(board.period_type))
                .await
            {
                warn!(board = %board, error = %e, "Failed to reverse leaderboard delta");
            }
        }
    }

    /// Write the toggle straight to the relational store and patch the cache.
    ///
    /// The user's set and the subject's counter may still reflect events
    /// waiting in the log, so only this toggle's change is applied to them.
    /// Reloading them from the relational store would lose those events.
    /// When the cache decided the action, the counter follows the flip even
    /// if no row moved.
    async fn write_direct(&self, event: &PendingEvent, cache_decided: bool) -> Result<i64> {
        let changed = match self.repo.apply_direct(event).await {
            Ok(changed) => changed,
            Err(e) => {
                error!(
                    user_id = %event.user_id,
                    subject_id = %event.subject_id,
                    kind = %event.kind,
                    error = %e,
                    "Toggle could not be recorded"
                );
                return Err(EngagementError::Durability(format!(
                    "Failed to record {} {} for user {} on book {}: {e}",
                    event.kind, event.action.as_str(), event.user_id, event.subject_id
                )));
            }
        };
        ToggleMetrics::record_direct_write(event.kind);
        info!(
            user_id = %event.user_id,
            subject_id = %event.subject_id,
            kind = %event.kind,
            action = event.action.as_str(),
            changed,
            "Toggle written directly to relational store"
        );

        if let Err(e) = self.set_membership(event, event.action).await {
            debug!(user_id = %event.user_id, error = %e, "Failed to patch cached membership");
            if let Err(e) = self.store.forget_engagements(event.user_id, event.kind).await {
                debug!(user_id = %event.user_id, error = %e, "Failed to drop cached membership");
            }
        }

        let delta = if changed || cache_decided {
            event.action.delta()
        } else {
            0
        };
        self.patch_count(event.subject_id, event.kind, delta).await
    }

    /// Move the cached counter by `delta` and return the resulting count.
    async fn patch_count(
        &self,
        subject_id: SubjectId,
        kind: EngagementKind,
        delta: i64,
    ) -> Result<i64> {
        let cached = if delta == 0 {
            self.store
                .counts(subject_id, self.config.counter_ttl)
                .await
                .map(|counts| counts.get(kind).map_or(Cached::Miss, Cached::Hit))
        } else {
            self.store
                .incr_count(subject_id, kind, delta, self.config.counter_ttl)
                .await
        };
        match cached {
            Ok(Cached::Hit(count)) => Ok(count.max(0)),
            // The relational count already includes this write.
            Ok(Cached::Miss) => self.seeded_count(subject_id, kind, 0).await,
            Err(e) => {
                debug!(subject_id = %subject_id, error = %e, "Counter cache unavailable, counting relations");
                if let Err(e) = self.store.forget_count(subject_id, kind).await {
                    debug!(subject_id = %subject_id, error = %e, "Failed to drop cached counter");
                }
                self.repo.count_active(subject_id, kind).await
            }
        }
    }

    async fn count_after_toggle(&self, event: &PendingEvent, counter: Cached<i64>) -> Result<i64> {
        match counter {
            Cached::Hit(count) => Ok(count.max(0)),
            // The pipeline has not applied this toggle's event yet.
            Cached::Miss => {
                self.seeded_count(event.subject_id, event.kind, event.action.delta())
                    .await
            }
        }
    }

    /// Relational count adjusted by `pending`, copied into the cache if
    /// absent there.
    async fn seeded_count(
        &self,
        subject_id: SubjectId,
        kind: EngagementKind,
        pending: i64,
    ) -> Result<i64> {
        let count = (self.repo.count_active(subject_id, kind).await? + pending).max(0);
        if let Err(e) = self
            .store
            .seed_count(subject_id, kind, count, self.config.counter_ttl)
            .await
        {
            debug!(subject_id = %subject_id, error = %e, "Failed to seed cached counter");
        }
        Ok(count)
    }

    /// Best-available aggregate count: cache, else relational.
    async fn current_count(&self, subject_id: SubjectId, kind: EngagementKind) -> Result<i64> {
        match self.store.counts(subject_id, self.config.counter_ttl).await {
            Ok(counts) => match counts.get(kind) {
                Some(count) => Ok(count.max(0)),
                None => self.seeded_count(subject_id, kind, 0).await,
            },
            Err(e) => {
                debug!(subject_id = %subject_id, error = %e, "Counter cache unavailable, counting relations");
                self.repo.count_active(subject_id, kind).await
            }
        }
    }

    /// Engagement state of one user on one subject.
    ///
    /// # Errors
    ///
    /// Returns error only if the relational store is needed and fails.
    pub async fn status(
        &self,
        user_id: UserId,
        subject_id: SubjectId,
        kind: EngagementKind,
    ) -> Result<EngagementStatus> {
        let (since, _) = self.current_state(user_id, subject_id, kind, true).await?;
        let count = self.current_count(subject_id, kind).await?;
        Ok(EngagementStatus {
            engaged: since.is_some(),
            count,
        })
    }

    /// Engagement state of one user on many subjects, in input order.
    ///
    /// # Errors
    ///
    /// Returns error only if the relational store is needed and fails.
    pub async fn batch_status(
        &self,
        user_id: UserId,
        subjects: &[SubjectId],
        kind: EngagementKind,
    ) -> Result<Vec<SubjectStatus>> {
        if subjects.is_empty() {
            return Ok(Vec::new());
        }

        let flags = match self.store.engaged_batch(user_id, subjects, kind).await {
            Ok(Cached::Hit(flags)) => flags,
            Ok(Cached::Miss) => {
                let relations = self.warm_user(user_id, kind).await?;
                subjects
                    .iter()
                    .map(|id| relations.iter().any(|(subject, _)| subject == id))
                    .collect()
            }
            Err(e) => {
                warn!(user_id = %user_id, kind = %kind, error = %e, "Fast store unavailable, checking relations directly");
                self.repo.relations_exist(user_id, subjects, kind).await?
            }
        };

        let counts = try_join_all(subjects.iter().map(|id| self.current_count(*id, kind))).await?;

        Ok(subjects
            .iter()
            .zip(flags)
            .zip(counts)
            .map(|((subject_id, engaged), count)| SubjectStatus {
                subject_id: *subject_id,
                engaged,
                count,
            })
            .collect())
    }

    /// A user's relations of one kind, newest first.
    ///
    /// The page request is normalized (page ≥ 1, size in `1..=100`).
    ///
    /// # Errors
    ///
    /// Returns error if the relational store fails.
    pub async fn list_user_engagements(
        &self,
        user_id: UserId,
        kind: EngagementKind,
        page: PageRequest,
    ) -> Result<Page<EngagementRecord>> {
        let page = PageRequest::new(page.page, page.page_size);
        self.repo.list_user_engagements(user_id, kind, page).await
    }

    /// Copy every durable counter into the cache (without overwriting).
    ///
    /// # Returns
    ///
    /// Number of subjects warmed.
    ///
    /// # Errors
    ///
    /// Returns error if either store fails.
    pub async fn warm_counters(&self) -> Result<usize> {
        let counters = self.repo.subject_counters().await?;
        for SubjectCounters {
            subject_id,
            likes,
            favorites,
        } in &counters
        {
            let ttl = self.config.counter_ttl;
            self.store
                .seed_count(*subject_id, EngagementKind::Like, *likes, ttl)
                .await?;
            self.store
                .seed_count(*subject_id, EngagementKind::Favorite, *favorites, ttl)
                .await?;
        }
        info!(subjects = counters.len(), "Warmed cached counters");
        Ok(counters.len())
    }
}
