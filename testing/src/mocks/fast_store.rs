use super::poisoned;
use chrono::{DateTime, Utc};
use shelfmark_core::{
    Cached, CachedCounts, EngagementError, EngagementKind, FastStore, LeaderboardKey, LockKey,
    LogConsumer, LogEntry, PendingEvent, Result, SubjectId, UserId,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct State {
    locks: HashMap<LockKey, Instant>,
    /// Presence of a key means the user's set is warm.
    sets: HashMap<(UserId, EngagementKind), HashMap<SubjectId, DateTime<Utc>>>,
    counters: HashMap<(SubjectId, EngagementKind), i64>,
    boards: HashMap<LeaderboardKey, HashMap<SubjectId, i64>>,
    logs: HashMap<EngagementKind, Log>,
}

#[derive(Debug, Default)]
struct Log {
    entries: Vec<LogEntry>,
    groups: HashMap<String, Group>,
}

#[derive(Debug, Default)]
struct Group {
    /// Index of the next never-delivered entry.
    cursor: usize,
    /// Delivered but unacknowledged entries by index.
    pending: BTreeMap<usize, Delivery>,
}

#[derive(Debug)]
struct Delivery {
    consumer: String,
    at: Instant,
}

#[derive(Debug, Default)]
struct Faults {
    all: AtomicBool,
    append: AtomicBool,
    log_reads: AtomicBool,
    latency_micros: AtomicU64,
}

impl Faults {
    fn check(&self, op: &str) -> Result<()> {
        if self.all.load(Ordering::SeqCst) {
            return Err(EngagementError::FastStore(format!("injected failure: {op}")));
        }
        Ok(())
    }

    async fn pause(&self) {
        let micros = self.latency_micros.load(Ordering::SeqCst);
        if micros > 0 {
            tokio::time::sleep(Duration::from_micros(micros)).await;
        }
    }
}

/// In-memory fast store.
///
/// Models the semantics the engines rely on: warm/cold membership sets,
/// increment-if-present counters and boards, a log with consumer groups,
/// pending entries and idle-based reclaim, and expiring locks. Other TTLs are
/// ignored; use the `evict_*` helpers to simulate expiry.
///
/// Injected latency is applied after each operation completes, so a caller
/// holding a lock yields while holding it.
#[derive(Debug, Clone, Default)]
pub struct MockFastStore {
    state: Arc<Mutex<State>>,
    faults: Arc<Faults>,
}

impl MockFastStore {
    /// Create an empty, healthy store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail, including consumers' reads and acks.
    pub fn set_failing(&self, failing: bool) {
        self.faults.all.store(failing, Ordering::SeqCst);
    }

    /// Make only `append_event` fail.
    pub fn set_append_failing(&self, failing: bool) {
        self.faults.append.store(failing, Ordering::SeqCst);
    }

    /// Make consumers' reads fail.
    pub fn set_log_read_failing(&self, failing: bool) {
        self.faults.log_reads.store(failing, Ordering::SeqCst);
    }

    /// Sleep this long after every operation.
    pub fn set_latency(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.faults.latency_micros.store(micros, Ordering::SeqCst);
    }

    fn with_state<R>(&self, op: &str, f: impl FnOnce(&mut State) -> R) -> Result<R> {
        self.faults.check(op)?;
        let mut state = self.state.lock().map_err(poisoned)?;
        Ok(f(&mut state))
    }

    fn inspect<R: Default>(&self, f: impl FnOnce(&State) -> R) -> R {
        self.state.lock().map(|state| f(&state)).unwrap_or_default()
    }

    // ═══════════════════════════════════════════════════════════
    // Test inspection and setup
    // ═══════════════════════════════════════════════════════════

    /// Cached membership: `None` if the user's set is cold.
    #[must_use]
    pub fn cached_engagement(
        &self,
        user_id: UserId,
        subject_id: SubjectId,
        kind: EngagementKind,
    ) -> Option<bool> {
        self.inspect(|s| {
            s.sets
                .get(&(user_id, kind))
                .map(|set| set.contains_key(&subject_id))
        })
    }

    /// Cached counter, `None` if not cached.
    #[must_use]
    pub fn cached_count(&self, subject_id: SubjectId, kind: EngagementKind) -> Option<i64> {
        self.inspect(|s| s.counters.get(&(subject_id, kind)).copied())
    }

    /// Score of a subject on a board, `None` if the board or the member is missing.
    #[must_use]
    pub fn board_score(&self, board: &LeaderboardKey, subject_id: SubjectId) -> Option<i64> {
        self.inspect(|s| s.boards.get(board).and_then(|b| b.get(&subject_id).copied()))
    }

    /// Whether a board exists.
    #[must_use]
    pub fn has_board(&self, board: &LeaderboardKey) -> bool {
        self.inspect(|s| s.boards.contains_key(board))
    }

    /// Number of entries ever appended to a kind's log.
    #[must_use]
    pub fn log_len(&self, kind: EngagementKind) -> usize {
        self.inspect(|s| s.logs.get(&kind).map_or(0, |log| log.entries.len()))
    }

    /// Entries of a kind's log decoded as events, in append order.
    #[must_use]
    pub fn logged_events(&self, kind: EngagementKind) -> Vec<PendingEvent> {
        self.inspect(|s| {
            s.logs.get(&kind).map_or_else(Vec::new, |log| {
                log.entries
                    .iter()
                    .filter_map(|entry| PendingEvent::from_fields(&entry.fields).ok())
                    .collect()
            })
        })
    }

    /// Entries delivered to `group` and not yet acknowledged.
    #[must_use]
    pub fn pending_len(&self, kind: EngagementKind, group: &str) -> usize {
        self.inspect(|s| {
            s.logs
                .get(&kind)
                .and_then(|log| log.groups.get(group))
                .map_or(0, |g| g.pending.len())
        })
    }

    /// Entries never delivered to `group`.
    #[must_use]
    pub fn undelivered_len(&self, kind: EngagementKind, group: &str) -> usize {
        self.inspect(|s| {
            s.logs.get(&kind).map_or(0, |log| {
                let cursor = log.groups.get(group).map_or(0, |g| g.cursor);
                log.entries.len().saturating_sub(cursor)
            })
        })
    }

    /// Whether a lock is currently held.
    #[must_use]
    pub fn lock_held(&self, key: &LockKey) -> bool {
        self.inspect(|s| s.locks.get(key).is_some_and(|exp| *exp > Instant::now()))
    }

    /// Simulate TTL expiry of a user's membership set.
    pub fn evict_user_set(&self, user_id: UserId, kind: EngagementKind) {
        let _ = self.state.lock().map(|mut s| s.sets.remove(&(user_id, kind)));
    }

    /// Simulate TTL expiry of every cached counter.
    pub fn evict_counters(&self) {
        let _ = self.state.lock().map(|mut s| s.counters.clear());
    }

    /// Simulate TTL expiry of every leaderboard.
    pub fn evict_boards(&self) {
        let _ = self.state.lock().map(|mut s| s.boards.clear());
    }

    /// Append an entry with arbitrary fields to a kind's log.
    pub fn append_raw(&self, kind: EngagementKind, fields: &[(&str, &str)]) {
        let _ = self.state.lock().map(|mut s| {
            let log = s.logs.entry(kind).or_default();
            let id = format!("{}-0", log.entries.len() + 1);
            log.entries.push(LogEntry {
                id,
                fields: fields
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect(),
            });
        });
    }

    /// Create a board with the given scores.
    pub fn seed_board(&self, board: &LeaderboardKey, entries: &[(SubjectId, i64)]) {
        let _ = self
            .state
            .lock()
            .map(|mut s| s.boards.insert(board.clone(), entries.iter().copied().collect()));
    }
}

impl FastStore for MockFastStore {
    type Consumer = MockLogConsumer;

    async fn try_lock(&self, key: &LockKey, ttl: Duration) -> Result<bool> {
        let acquired = self.with_state("try_lock", |s| {
            let now = Instant::now();
            match s.locks.get(key) {
                Some(expires) if *expires > now => false,
                _ => {
                    s.locks.insert(key.clone(), now + ttl);
                    true
                }
            }
        })?;
        self.faults.pause().await;
        Ok(acquired)
    }

    async fn unlock(&self, key: &LockKey) -> Result<()> {
        self.with_state("unlock", |s| {
            s.locks.remove(key);
        })?;
        self.faults.pause().await;
        Ok(())
    }

    async fn engaged_since(
        &self,
        user_id: UserId,
        subject_id: SubjectId,
        kind: EngagementKind,
    ) -> Result<Cached<Option<DateTime<Utc>>>> {
        let cached = self.with_state("engaged_since", |s| {
            s.sets.get(&(user_id, kind)).map_or(Cached::Miss, |set| {
                Cached::Hit(set.get(&subject_id).copied())
            })
        })?;
        self.faults.pause().await;
        Ok(cached)
    }

    async fn engaged_batch(
        &self,
        user_id: UserId,
        subjects: &[SubjectId],
        kind: EngagementKind,
    ) -> Result<Cached<Vec<bool>>> {
        let cached = self.with_state("engaged_batch", |s| {
            s.sets.get(&(user_id, kind)).map_or(Cached::Miss, |set| {
                Cached::Hit(subjects.iter().map(|id| set.contains_key(id)).collect())
            })
        })?;
        self.faults.pause().await;
        Ok(cached)
    }

    async fn warm_engagements(
        &self,
        user_id: UserId,
        kind: EngagementKind,
        relations: &[(SubjectId, DateTime<Utc>)],
        _ttl: Duration,
    ) -> Result<()> {
        self.with_state("warm_engagements", |s| {
            s.sets
                .insert((user_id, kind), relations.iter().copied().collect());
        })?;
        self.faults.pause().await;
        Ok(())
    }

    async fn add_engagement(
        &self,
        user_id: UserId,
        subject_id: SubjectId,
        kind: EngagementKind,
        created_at: DateTime<Utc>,
        _ttl: Duration,
    ) -> Result<()> {
        self.with_state("add_engagement", |s| {
            // A cold set stays cold: without the warm marker a partial set
            // would read as complete.
            if let Some(set) = s.sets.get_mut(&(user_id, kind)) {
                set.insert(subject_id, created_at);
            }
        })?;
        self.faults.pause().await;
        Ok(())
    }

    async fn remove_engagement(
        &self,
        user_id: UserId,
        subject_id: SubjectId,
        kind: EngagementKind,
        _ttl: Duration,
    ) -> Result<()> {
        self.with_state("remove_engagement", |s| {
            if let Some(set) = s.sets.get_mut(&(user_id, kind)) {
                set.remove(&subject_id);
            }
        })?;
        self.faults.pause().await;
        Ok(())
    }

    async fn forget_engagements(&self, user_id: UserId, kind: EngagementKind) -> Result<()> {
        self.with_state("forget_engagements", |s| {
            s.sets.remove(&(user_id, kind));
        })?;
        self.faults.pause().await;
        Ok(())
    }

    async fn incr_count(
        &self,
        subject_id: SubjectId,
        kind: EngagementKind,
        delta: i64,
        _ttl: Duration,
    ) -> Result<Cached<i64>> {
        let cached = self.with_state("incr_count", |s| {
            s.counters
                .get_mut(&(subject_id, kind))
                .map_or(Cached::Miss, |count| {
                    *count += delta;
                    Cached::Hit(*count)
                })
        })?;
        self.faults.pause().await;
        Ok(cached)
    }

    async fn counts(&self, subject_id: SubjectId, _ttl: Duration) -> Result<CachedCounts> {
        let counts = self.with_state("counts", |s| CachedCounts {
            likes: s.counters.get(&(subject_id, EngagementKind::Like)).copied(),
            favorites: s
                .counters
                .get(&(subject_id, EngagementKind::Favorite))
                .copied(),
        })?;
        self.faults.pause().await;
        Ok(counts)
    }

    async fn seed_count(
        &self,
        subject_id: SubjectId,
        kind: EngagementKind,
        value: i64,
        _ttl: Duration,
    ) -> Result<()> {
        self.with_state("seed_count", |s| {
            s.counters.entry((subject_id, kind)).or_insert(value);
        })?;
        self.faults.pause().await;
        Ok(())
    }

    async fn forget_count(&self, subject_id: SubjectId, kind: EngagementKind) -> Result<()> {
        self.with_state("forget_count", |s| {
            s.counters.remove(&(subject_id, kind));
        })?;
        self.faults.pause().await;
        Ok(())
    }

    async fn incr_score(
        &self,
        board: &LeaderboardKey,
        subject_id: SubjectId,
        delta: i64,
        _ttl: Duration,
    ) -> Result<bool> {
        let applied = self.with_state("incr_score", |s| {
            s.boards.get_mut(board).is_some_and(|scores| {
                *scores.entry(subject_id).or_insert(0) += delta;
                true
            })
        })?;
        self.faults.pause().await;
        Ok(applied)
    }

    async fn top_scores(
        &self,
        board: &LeaderboardKey,
        limit: usize,
    ) -> Result<Vec<(SubjectId, i64)>> {
        let top = self.with_state("top_scores", |s| {
            let mut entries: Vec<(SubjectId, i64)> = s
                .boards
                .get(board)
                .map(|scores| {
                    scores
                        .iter()
                        .filter(|(_, score)| **score > 0)
                        .map(|(id, score)| (*id, *score))
                        .collect()
                })
                .unwrap_or_default();
            entries.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
            entries.truncate(limit);
            entries
        })?;
        self.faults.pause().await;
        Ok(top)
    }

    async fn replace_leaderboard(
        &self,
        board: &LeaderboardKey,
        entries: &[(SubjectId, i64)],
        _ttl: Duration,
    ) -> Result<()> {
        self.with_state("replace_leaderboard", |s| {
            // An empty sorted set does not exist.
            if entries.is_empty() {
                s.boards.remove(board);
            } else {
                s.boards
                    .insert(board.clone(), entries.iter().copied().collect());
            }
        })?;
        self.faults.pause().await;
        Ok(())
    }

    async fn append_event(&self, event: &PendingEvent) -> Result<String> {
        if self.faults.append.load(Ordering::SeqCst) {
            return Err(EngagementError::FastStore(
                "injected failure: append_event".to_string(),
            ));
        }
        let id = self.with_state("append_event", |s| {
            let log = s.logs.entry(event.kind).or_default();
            let id = format!("{}-0", log.entries.len() + 1);
            log.entries.push(LogEntry {
                id: id.clone(),
                fields: event
                    .to_fields()
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect(),
            });
            id
        })?;
        self.faults.pause().await;
        Ok(id)
    }

    async fn ensure_group(&self, kind: EngagementKind, group: &str) -> Result<()> {
        self.with_state("ensure_group", |s| {
            s.logs
                .entry(kind)
                .or_default()
                .groups
                .entry(group.to_string())
                .or_default();
        })?;
        Ok(())
    }

    async fn consumer(
        &self,
        kind: EngagementKind,
        group: &str,
        name: &str,
    ) -> Result<MockLogConsumer> {
        self.faults.check("consumer")?;
        Ok(MockLogConsumer {
            state: Arc::clone(&self.state),
            faults: Arc::clone(&self.faults),
            kind,
            group: group.to_string(),
            name: name.to_string(),
        })
    }
}

/// Consumer over a [`MockFastStore`] log.
#[derive(Debug)]
pub struct MockLogConsumer {
    state: Arc<Mutex<State>>,
    faults: Arc<Faults>,
    kind: EngagementKind,
    group: String,
    name: String,
}

impl MockLogConsumer {
    fn check_reads(&self) -> Result<()> {
        self.faults.check("read")?;
        if self.faults.log_reads.load(Ordering::SeqCst) {
            return Err(EngagementError::FastStore(
                "injected failure: log read".to_string(),
            ));
        }
        Ok(())
    }

    fn take_new(&self, count: usize) -> Result<Vec<LogEntry>> {
        let mut state = self.state.lock().map_err(poisoned)?;
        let log = state.logs.entry(self.kind).or_default();
        let group = log.groups.get_mut(&self.group).ok_or_else(|| {
            EngagementError::FastStore(format!("NOGROUP no such consumer group {}", self.group))
        })?;
        let end = (group.cursor + count).min(log.entries.len());
        let now = Instant::now();
        let taken: Vec<LogEntry> = (group.cursor..end)
            .map(|index| {
                group.pending.insert(
                    index,
                    Delivery {
                        consumer: self.name.clone(),
                        at: now,
                    },
                );
                log.entries[index].clone()
            })
            .collect();
        group.cursor = end;
        Ok(taken)
    }
}

fn entry_index(id: &str) -> Option<usize> {
    id.split('-')
        .next()?
        .parse::<usize>()
        .ok()?
        .checked_sub(1)
}

impl LogConsumer for MockLogConsumer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_new(&mut self, count: usize, block: Duration) -> Result<Vec<LogEntry>> {
        let deadline = Instant::now() + block;
        loop {
            self.check_reads()?;
            let entries = self.take_new(count)?;
            if !entries.is_empty() {
                self.faults.pause().await;
                return Ok(entries);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep((deadline - now).min(Duration::from_millis(5))).await;
        }
    }

    async fn claim_stale(&mut self, min_idle: Duration, count: usize) -> Result<Vec<LogEntry>> {
        self.check_reads()?;
        let claimed = {
            let mut state = self.state.lock().map_err(poisoned)?;
            let log = state.logs.entry(self.kind).or_default();
            let group = log.groups.get_mut(&self.group).ok_or_else(|| {
                EngagementError::FastStore(format!(
                    "NOGROUP no such consumer group {}",
                    self.group
                ))
            })?;
            let now = Instant::now();
            let mut claimed = Vec::new();
            for (index, delivery) in &mut group.pending {
                if claimed.len() >= count {
                    break;
                }
                if now.duration_since(delivery.at) >= min_idle {
                    delivery.consumer.clone_from(&self.name);
                    delivery.at = now;
                    claimed.push(log.entries[*index].clone());
                }
            }
            claimed
        };
        self.faults.pause().await;
        Ok(claimed)
    }

    async fn ack(&mut self, ids: &[String]) -> Result<u64> {
        self.faults.check("ack")?;
        let acked = {
            let mut state = self.state.lock().map_err(poisoned)?;
            let group = state
                .logs
                .entry(self.kind)
                .or_default()
                .groups
                .get_mut(&self.group);
            group.map_or(0, |group| {
                ids.iter()
                    .filter_map(|id| entry_index(id))
                    .filter(|index| group.pending.remove(index).is_some())
                    .count() as u64
            })
        };
        self.faults.pause().await;
        Ok(acked)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code
mod tests {
    use super::*;
    use shelfmark_core::{EngagementAction, PeriodType};

    fn event(user: i64) -> PendingEvent {
        PendingEvent::new(
            UserId(user),
            SubjectId(7),
            EngagementKind::Like,
            EngagementAction::On,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_until_released() {
        let store = MockFastStore::new();
        let key = LockKey::Toggle {
            user_id: UserId(1),
            subject_id: SubjectId(7),
            kind: EngagementKind::Like,
        };
        assert!(store.try_lock(&key, Duration::from_secs(1)).await.unwrap());
        assert!(!store.try_lock(&key, Duration::from_secs(1)).await.unwrap());
        store.unlock(&key).await.unwrap();
        assert!(store.try_lock(&key, Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_cold_set_and_counter_miss() {
        let store = MockFastStore::new();
        let ttl = Duration::from_secs(60);
        let cached = store
            .engaged_since(UserId(1), SubjectId(7), EngagementKind::Like)
            .await
            .unwrap();
        assert!(cached.is_miss());
        assert!(
            store
                .incr_count(SubjectId(7), EngagementKind::Like, 1, ttl)
                .await
                .unwrap()
                .is_miss()
        );
        assert_eq!(store.cached_count(SubjectId(7), EngagementKind::Like), None);
    }

    #[tokio::test]
    async fn test_incr_score_requires_existing_board() {
        let store = MockFastStore::new();
        let board = LeaderboardKey {
            kind: EngagementKind::Like,
            period_type: PeriodType::Week,
            period_key: "2025-W45".into(),
        };
        let ttl = Duration::from_secs(60);
        assert!(!store.incr_score(&board, SubjectId(7), 1, ttl).await.unwrap());
        assert!(!store.has_board(&board));

        store.seed_board(&board, &[(SubjectId(1), 3)]);
        assert!(store.incr_score(&board, SubjectId(7), 1, ttl).await.unwrap());
        assert_eq!(store.board_score(&board, SubjectId(7)), Some(1));
    }

    #[tokio::test]
    async fn test_unacked_entries_are_reclaimed() {
        let store = MockFastStore::new();
        store.ensure_group(EngagementKind::Like, "g").await.unwrap();
        store.append_event(&event(1)).await.unwrap();
        store.append_event(&event(2)).await.unwrap();

        let mut first = store.consumer(EngagementKind::Like, "g", "worker-0").await.unwrap();
        let mut second = store.consumer(EngagementKind::Like, "g", "worker-1").await.unwrap();

        let read = first.read_new(10, Duration::ZERO).await.unwrap();
        assert_eq!(read.len(), 2);
        assert!(second.read_new(10, Duration::ZERO).await.unwrap().is_empty());
        assert_eq!(store.pending_len(EngagementKind::Like, "g"), 2);

        let claimed = second.claim_stale(Duration::ZERO, 10).await.unwrap();
        assert_eq!(claimed, read);

        let ids: Vec<String> = claimed.into_iter().map(|e| e.id).collect();
        assert_eq!(second.ack(&ids).await.unwrap(), 2);
        assert_eq!(store.pending_len(EngagementKind::Like, "g"), 0);
    }

    #[tokio::test]
    async fn test_failures_are_fast_store_errors() {
        let store = MockFastStore::new();
        store.set_append_failing(true);
        assert!(matches!(
            store.append_event(&event(1)).await,
            Err(EngagementError::FastStore(_))
        ));

        store.set_append_failing(false);
        store.set_failing(true);
        assert!(store.counts(SubjectId(1), Duration::ZERO).await.is_err());
    }
}
