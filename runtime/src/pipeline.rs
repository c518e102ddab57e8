//! Write-behind reconciliation pipeline.
//!
//! A pool of [`SyncWorker`]s per engagement kind drains the kind's event log
//! through one consumer group. Each iteration:
//!
//! 1. Reclaims entries another worker left pending longer than the pending
//!    timeout, or else blocks briefly for new entries
//! 2. Decodes them (undecodable entries are dropped with a warning)
//! 3. Collapses the batch to the net change per (user, subject)
//! 4. Applies it in one relational transaction
//! 5. Acknowledges every entry of the batch on commit
//!
//! A failed transaction acknowledges nothing; the entries are reclaimed after
//! the pending timeout. That is the only retry path.

use crate::metrics::PipelineMetrics;
use crate::retry::{Backoff, RetryPolicy};
use crate::supervisor::{ShutdownSignal, TaskSupervisor};
use shelfmark_core::{
    EngagementAction, EngagementConfig, EngagementKind, EngagementRepository, FastStore,
    LogConsumer, LogEntry, PendingEvent, Result, SubjectId, UserId,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Builds and starts the worker pool.
pub struct ReconciliationPipeline<S, R> {
    store: Arc<S>,
    repo: Arc<R>,
    config: EngagementConfig,
    retry: RetryPolicy,
}

impl<S: FastStore, R: EngagementRepository> ReconciliationPipeline<S, R> {
    /// Create a pipeline over the given stores.
    #[must_use]
    pub fn new(store: Arc<S>, repo: Arc<R>, config: EngagementConfig) -> Self {
        Self {
            store,
            repo,
            config,
            retry: RetryPolicy::builder()
                .initial_delay(Duration::from_millis(200))
                .max_delay(Duration::from_secs(10))
                .build(),
        }
    }

    /// Set the backoff used after failed iterations.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Create consumer groups and spawn `workers_per_kind` workers per kind
    /// under the supervisor.
    ///
    /// # Returns
    ///
    /// Number of workers spawned.
    ///
    /// # Errors
    ///
    /// Returns error if a group or consumer cannot be created.
    pub async fn start(&self, supervisor: &mut TaskSupervisor) -> Result<usize> {
        let group = &self.config.consumer_group;
        let mut spawned = 0;
        for kind in EngagementKind::ALL {
            self.store.ensure_group(kind, group).await?;
            for index in 0..self.config.workers_per_kind {
                let worker = self.worker(kind, index).await?;
                supervisor.spawn(
                    format!("sync-{kind}-worker-{index}"),
                    worker.run(supervisor.signal()),
                );
                spawned += 1;
            }
        }
        info!(workers = spawned, group = %group, "Reconciliation pipeline started");
        Ok(spawned)
    }

    /// Open worker `index` for `kind` without spawning it.
    ///
    /// # Errors
    ///
    /// Returns error if the consumer cannot be created.
    pub async fn worker(&self, kind: EngagementKind, index: usize) -> Result<SyncWorker<S, R>> {
        let name = format!("worker-{index}");
        let consumer = self
            .store
            .consumer(kind, &self.config.consumer_group, &name)
            .await?;
        Ok(SyncWorker {
            consumer,
            store: Arc::clone(&self.store),
            repo: Arc::clone(&self.repo),
            kind,
            config: self.config.clone(),
            backoff: Backoff::new(self.retry.clone()),
        })
    }
}

/// One named consumer applying batches of one kind.
pub struct SyncWorker<S: FastStore, R> {
    consumer: S::Consumer,
    store: Arc<S>,
    repo: Arc<R>,
    kind: EngagementKind,
    config: EngagementConfig,
    backoff: Backoff,
}

impl<S: FastStore, R: EngagementRepository> SyncWorker<S, R> {
    /// Run until shutdown is signalled. The batch in flight when the signal
    /// arrives is finished and acknowledged first.
    ///
    /// # Errors
    ///
    /// Never returns an error; failed iterations are logged and retried.
    pub async fn run(mut self, mut signal: ShutdownSignal) -> Result<()> {
        info!(worker = self.consumer.name(), kind = %self.kind, "Sync worker started");
        while !signal.is_shutdown() {
            match self.poll_once().await {
                Ok(_) => self.backoff.reset(),
                Err(e) => {
                    let delay = self.backoff.failure();
                    warn!(
                        worker = self.consumer.name(),
                        kind = %self.kind,
                        failures = self.backoff.failures(),
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "Sync iteration failed, backing off"
                    );
                    if signal.sleep(delay).await {
                        break;
                    }
                }
            }
        }
        info!(worker = self.consumer.name(), kind = %self.kind, "Sync worker stopped");
        Ok(())
    }

    /// Run one iteration.
    ///
    /// # Returns
    ///
    /// Number of log entries acknowledged.
    ///
    /// # Errors
    ///
    /// Returns error if reading the log or committing the batch fails.
    pub async fn poll_once(&mut self) -> Result<usize> {
        let batch_size = self.config.batch_size;
        let mut entries = self
            .consumer
            .claim_stale(self.config.pending_timeout, batch_size)
            .await?;
        if entries.is_empty() {
            entries = self
                .consumer
                .read_new(batch_size, self.config.block_timeout)
                .await?;
        } else {
            PipelineMetrics::record_reclaimed(self.kind, entries.len());
            info!(
                worker = self.consumer.name(),
                kind = %self.kind,
                entries = entries.len(),
                "Reclaimed stale entries"
            );
        }
        if entries.is_empty() {
            return Ok(0);
        }
        self.process(entries).await
    }

    async fn process(&mut self, entries: Vec<LogEntry>) -> Result<usize> {
        let ids: Vec<String> = entries.iter().map(|entry| entry.id.clone()).collect();
        let events = decode_entries(self.kind, &entries);
        if events.len() < entries.len() {
            PipelineMetrics::record_malformed(self.kind, entries.len() - events.len());
        }

        let (on, off) = collapse(events);
        if !on.is_empty() || !off.is_empty() {
            match self.repo.apply_batch(self.kind, &on, &off).await {
                Ok(outcome) => {
                    PipelineMetrics::record_batch(
                        self.kind,
                        outcome.inserted,
                        outcome.deleted,
                        outcome.skipped,
                    );
                    debug!(
                        worker = self.consumer.name(),
                        kind = %self.kind,
                        entries = ids.len(),
                        inserted = outcome.inserted,
                        deleted = outcome.deleted,
                        skipped = outcome.skipped,
                        "Batch committed"
                    );
                }
                Err(e) => {
                    PipelineMetrics::record_batch_failure(self.kind);
                    error!(
                        worker = self.consumer.name(),
                        kind = %self.kind,
                        entries = ids.len(),
                        error = %e,
                        "Batch rolled back, entries left pending"
                    );
                    return Err(e);
                }
            }
        }

        match self.consumer.ack(&ids).await {
            Ok(acked) if acked < ids.len() as u64 => {
                debug!(worker = self.consumer.name(), acked, entries = ids.len(), "Some entries were already acknowledged");
            }
            Ok(_) => {}
            Err(e) => {
                PipelineMetrics::record_ack_failure(self.kind);
                warn!(
                    worker = self.consumer.name(),
                    kind = %self.kind,
                    error = %e,
                    "Failed to acknowledge committed batch, entries will be redelivered"
                );
            }
        }

        self.forget_counters(on.iter().chain(off.iter())).await;
        Ok(ids.len())
    }

    /// Cached counters of touched subjects reseed from the durable ones.
    async fn forget_counters<'a>(&self, events: impl Iterator<Item = &'a PendingEvent>) {
        let subjects: BTreeSet<SubjectId> = events.map(|event| event.subject_id).collect();
        for subject_id in subjects {
            if let Err(e) = self.store.forget_count(subject_id, self.kind).await {
                debug!(subject_id = %subject_id, error = %e, "Failed to drop cached counter");
            }
        }
    }
}

/// Decode entries of `kind`'s log, dropping anything undecodable.
fn decode_entries(kind: EngagementKind, entries: &[LogEntry]) -> Vec<PendingEvent> {
    entries
        .iter()
        .filter_map(|entry| match PendingEvent::from_fields(&entry.fields) {
            Ok(event) if event.kind == kind => Some(event),
            Ok(event) => {
                warn!(entry_id = %entry.id, expected = %kind, found = %event.kind, "Dropping event from wrong log");
                None
            }
            Err(e) => {
                warn!(entry_id = %entry.id, error = %e, "Dropping undecodable log entry");
                None
            }
        })
        .collect()
}

/// Reduce a batch (in log order) to its net effect per (user, subject).
///
/// The last event of a key decides the final state. When the last event
/// creates the relation and an earlier one removed it, the removal is kept as
/// well, so the relation is recreated with the newer creation time.
///
/// # Returns
///
/// `(on, off)`: relations to create and relations to remove (removals first).
#[must_use]
pub fn collapse(events: Vec<PendingEvent>) -> (Vec<PendingEvent>, Vec<PendingEvent>) {
    struct Net {
        first_removal: Option<PendingEvent>,
        last: PendingEvent,
    }

    let mut order: Vec<(UserId, SubjectId)> = Vec::new();
    let mut nets: HashMap<(UserId, SubjectId), Net> = HashMap::new();
    for event in events {
        let key = (event.user_id, event.subject_id);
        match nets.get_mut(&key) {
            Some(net) => {
                if net.first_removal.is_none() && event.action == EngagementAction::Off {
                    net.first_removal = Some(event.clone());
                }
                net.last = event;
            }
            None => {
                order.push(key);
                let first_removal = (event.action == EngagementAction::Off).then(|| event.clone());
                nets.insert(
                    key,
                    Net {
                        first_removal,
                        last: event,
                    },
                );
            }
        }
    }

    let mut on = Vec::new();
    let mut off = Vec::new();
    for key in order {
        let Some(net) = nets.remove(&key) else {
            continue;
        };
        match net.last.action {
            EngagementAction::Off => off.push(net.last),
            EngagementAction::On => {
                if let Some(removal) = net.first_removal {
                    off.push(removal);
                }
                on.push(net.last);
            }
        }
    }
    (on, off)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    fn event(user: i64, subject: i64, action: EngagementAction, second: u32) -> PendingEvent {
        PendingEvent::new(
            UserId(user),
            SubjectId(subject),
            EngagementKind::Like,
            action,
            Utc.with_ymd_and_hms(2025, 11, 5, 12, 0, second).unwrap(),
        )
    }

    #[test]
    fn test_collapse_keeps_last_action() {
        let (on, off) = collapse(vec![
            event(1, 7, EngagementAction::On, 0),
            event(1, 7, EngagementAction::Off, 1),
            event(2, 7, EngagementAction::On, 2),
        ]);
        assert_eq!(on, vec![event(2, 7, EngagementAction::On, 2)]);
        assert_eq!(off, vec![event(1, 7, EngagementAction::Off, 1)]);
    }

    #[test]
    fn test_collapse_recreation_removes_then_inserts() {
        let (on, off) = collapse(vec![
            event(1, 7, EngagementAction::Off, 0),
            event(1, 7, EngagementAction::On, 1),
            event(1, 7, EngagementAction::Off, 2),
            event(1, 7, EngagementAction::On, 3),
        ]);
        assert_eq!(off, vec![event(1, 7, EngagementAction::Off, 0)]);
        assert_eq!(on, vec![event(1, 7, EngagementAction::On, 3)]);
    }

    #[test]
    fn test_decode_drops_malformed_and_foreign_entries() {
        let good = event(1, 7, EngagementAction::On, 0);
        let fields = |e: &PendingEvent| -> HashMap<String, String> {
            e.to_fields().into_iter().map(|(k, v)| (k.to_string(), v)).collect()
        };
        let mut favorite = good.clone();
        favorite.kind = EngagementKind::Favorite;

        let entries = vec![
            LogEntry { id: "1-0".into(), fields: fields(&good) },
            LogEntry { id: "2-0".into(), fields: HashMap::from([("junk".to_string(), "1".to_string())]) },
            LogEntry { id: "3-0".into(), fields: fields(&favorite) },
        ];
        assert_eq!(decode_entries(EngagementKind::Like, &entries), vec![good]);
    }

    proptest! {
        /// Applying the collapsed batch to any starting state gives the same
        /// final membership as applying every event in order.
        #[test]
        fn prop_collapse_preserves_final_state(
            actions in prop::collection::vec((1i64..=3, 1i64..=3, any::<bool>()), 0..40),
            initial in prop::collection::btree_set((1i64..=3, 1i64..=3), 0..9),
        ) {
            let events: Vec<PendingEvent> = actions
                .iter()
                .enumerate()
                .map(|(i, (u, s, on))| {
                    let action = if *on { EngagementAction::On } else { EngagementAction::Off };
                    event(*u, *s, action, u32::try_from(i % 60).unwrap())
                })
                .collect();

            let mut sequential: BTreeSet<(i64, i64)> = initial.clone();
            for e in &events {
                let key = (e.user_id.0, e.subject_id.0);
                match e.action {
                    EngagementAction::On => { sequential.insert(key); }
                    EngagementAction::Off => { sequential.remove(&key); }
                }
            }

            let (on, off) = collapse(events);
            let mut collapsed = initial;
            for e in &off {
                collapsed.remove(&(e.user_id.0, e.subject_id.0));
            }
            for e in &on {
                collapsed.insert((e.user_id.0, e.subject_id.0));
            }
            prop_assert_eq!(collapsed, sequential);
        }
    }
}
