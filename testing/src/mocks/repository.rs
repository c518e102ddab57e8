use super::poisoned;
use chrono::{DateTime, Utc};
use shelfmark_core::{
    BatchOutcome, EngagementAction, EngagementError, EngagementKind, EngagementRecord,
    EngagementRepository, Page, PageRequest, PendingEvent, Result, Subject, SubjectCounters,
    SubjectId, UserId,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Default)]
struct State {
    relations: HashMap<(UserId, SubjectId, EngagementKind), DateTime<Utc>>,
    subjects: BTreeMap<SubjectId, Subject>,
}

impl State {
    /// Insert-if-absent plus counter increment, as one relational statement pair.
    fn insert(&mut self, event: &PendingEvent) -> bool {
        let key = (event.user_id, event.subject_id, event.kind);
        if self.relations.contains_key(&key) {
            return false;
        }
        self.relations.insert(key, event.timestamp);
        self.bump(event.subject_id, event.kind, 1);
        true
    }

    fn delete(&mut self, event: &PendingEvent) -> bool {
        let key = (event.user_id, event.subject_id, event.kind);
        if self.relations.remove(&key).is_none() {
            return false;
        }
        self.bump(event.subject_id, event.kind, -1);
        true
    }

    fn bump(&mut self, subject_id: SubjectId, kind: EngagementKind, delta: i64) {
        if let Some(subject) = self.subjects.get_mut(&subject_id) {
            match kind {
                EngagementKind::Like => subject.like_count += delta,
                EngagementKind::Favorite => subject.favorite_count += delta,
            }
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    all: AtomicBool,
    batches: AtomicBool,
    direct: AtomicBool,
    batch_calls: AtomicUsize,
}

/// In-memory relational store.
///
/// `apply_batch` works on a copy of the state and swaps it in on success, so
/// a failed batch leaves nothing behind. Removals are applied before inserts.
#[derive(Debug, Clone, Default)]
pub struct MockEngagementRepository {
    state: Arc<Mutex<State>>,
    faults: Arc<Faults>,
}

impl MockEngagementRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a repository holding the given books.
    #[must_use]
    pub fn with_subjects(subjects: impl IntoIterator<Item = Subject>) -> Self {
        let repo = Self::new();
        if let Ok(mut state) = repo.state.lock() {
            state
                .subjects
                .extend(subjects.into_iter().map(|s| (s.id, s)));
        }
        repo
    }

    /// Make every call fail.
    pub fn set_failing(&self, failing: bool) {
        self.faults.all.store(failing, Ordering::SeqCst);
    }

    /// Make only `apply_batch` fail.
    pub fn set_batch_failing(&self, failing: bool) {
        self.faults.batches.store(failing, Ordering::SeqCst);
    }

    /// Make only `apply_direct` fail.
    pub fn set_direct_failing(&self, failing: bool) {
        self.faults.direct.store(failing, Ordering::SeqCst);
    }

    /// Number of `apply_batch` calls, successful or not.
    #[must_use]
    pub fn batch_calls(&self) -> usize {
        self.faults.batch_calls.load(Ordering::SeqCst)
    }

    /// Seed a relation as if it had been applied earlier.
    pub fn insert_relation(
        &self,
        user_id: UserId,
        subject_id: SubjectId,
        kind: EngagementKind,
        created_at: DateTime<Utc>,
    ) {
        let event = PendingEvent::new(user_id, subject_id, kind, EngagementAction::On, created_at);
        let _ = self.state.lock().map(|mut s| s.insert(&event));
    }

    /// Remove a book row (relations stay).
    pub fn remove_subject(&self, subject_id: SubjectId) {
        let _ = self.state.lock().map(|mut s| s.subjects.remove(&subject_id));
    }

    /// Whether a relation row exists.
    #[must_use]
    pub fn has_relation(&self, user_id: UserId, subject_id: SubjectId, kind: EngagementKind) -> bool {
        self.state
            .lock()
            .map(|s| s.relations.contains_key(&(user_id, subject_id, kind)))
            .unwrap_or(false)
    }

    /// Durable counter of a book, `None` if the book row does not exist.
    #[must_use]
    pub fn durable_count(&self, subject_id: SubjectId, kind: EngagementKind) -> Option<i64> {
        self.state.lock().ok().and_then(|s| {
            s.subjects.get(&subject_id).map(|subject| match kind {
                EngagementKind::Like => subject.like_count,
                EngagementKind::Favorite => subject.favorite_count,
            })
        })
    }

    fn check(&self) -> Result<()> {
        if self.faults.all.load(Ordering::SeqCst) {
            return Err(EngagementError::Database("injected failure".to_string()));
        }
        Ok(())
    }

    fn read<R>(&self, f: impl FnOnce(&State) -> R) -> Result<R> {
        self.check()?;
        let state = self.state.lock().map_err(poisoned)?;
        Ok(f(&state))
    }
}

impl EngagementRepository for MockEngagementRepository {
    async fn relation_since(
        &self,
        user_id: UserId,
        subject_id: SubjectId,
        kind: EngagementKind,
    ) -> Result<Option<DateTime<Utc>>> {
        self.read(|s| s.relations.get(&(user_id, subject_id, kind)).copied())
    }

    async fn relations_exist(
        &self,
        user_id: UserId,
        subjects: &[SubjectId],
        kind: EngagementKind,
    ) -> Result<Vec<bool>> {
        self.read(|s| {
            subjects
                .iter()
                .map(|id| s.relations.contains_key(&(user_id, *id, kind)))
                .collect()
        })
    }

    async fn user_relations(
        &self,
        user_id: UserId,
        kind: EngagementKind,
    ) -> Result<Vec<(SubjectId, DateTime<Utc>)>> {
        self.read(|s| {
            s.relations
                .iter()
                .filter(|((user, _, k), _)| *user == user_id && *k == kind)
                .map(|((_, subject, _), at)| (*subject, *at))
                .collect()
        })
    }

    async fn count_active(&self, subject_id: SubjectId, kind: EngagementKind) -> Result<i64> {
        self.read(|s| {
            s.relations
                .keys()
                .filter(|(_, subject, k)| *subject == subject_id && *k == kind)
                .count() as i64
        })
    }

    async fn apply_direct(&self, event: &PendingEvent) -> Result<bool> {
        self.check()?;
        if self.faults.direct.load(Ordering::SeqCst) {
            return Err(EngagementError::Database("injected failure: direct write".to_string()));
        }
        let mut state = self.state.lock().map_err(poisoned)?;
        Ok(match event.action {
            EngagementAction::On => state.insert(event),
            EngagementAction::Off => state.delete(event),
        })
    }

    async fn apply_batch(
        &self,
        kind: EngagementKind,
        on: &[PendingEvent],
        off: &[PendingEvent],
    ) -> Result<BatchOutcome> {
        self.faults.batch_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        if self.faults.batches.load(Ordering::SeqCst) {
            return Err(EngagementError::Database("injected failure: batch".to_string()));
        }

        let mut state = self.state.lock().map_err(poisoned)?;
        let mut tx = state.clone();
        let mut outcome = BatchOutcome::default();
        for event in off {
            if event.kind != kind {
                return Err(EngagementError::Internal(format!(
                    "{} event in {kind} batch",
                    event.kind
                )));
            }
            if tx.delete(event) {
                outcome.deleted += 1;
            } else {
                outcome.skipped += 1;
            }
        }
        for event in on {
            if event.kind != kind {
                return Err(EngagementError::Internal(format!(
                    "{} event in {kind} batch",
                    event.kind
                )));
            }
            if tx.insert(event) {
                outcome.inserted += 1;
            } else {
                outcome.skipped += 1;
            }
        }
        *state = tx;
        Ok(outcome)
    }

    async fn count_created_between(
        &self,
        kind: EngagementKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<(SubjectId, i64)>> {
        self.read(|s| {
            let mut grouped: BTreeMap<SubjectId, i64> = BTreeMap::new();
            for ((_, subject, k), at) in &s.relations {
                if *k == kind && start <= *at && *at < end {
                    *grouped.entry(*subject).or_insert(0) += 1;
                }
            }
            let mut counts: Vec<(SubjectId, i64)> = grouped.into_iter().collect();
            counts.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
            counts
        })
    }

    async fn subjects(&self, ids: &[SubjectId]) -> Result<Vec<Subject>> {
        self.read(|s| ids.iter().filter_map(|id| s.subjects.get(id).cloned()).collect())
    }

    async fn subject_counters(&self) -> Result<Vec<SubjectCounters>> {
        self.read(|s| {
            s.subjects
                .values()
                .map(|subject| SubjectCounters {
                    subject_id: subject.id,
                    likes: subject.like_count,
                    favorites: subject.favorite_count,
                })
                .collect()
        })
    }

    async fn list_user_engagements(
        &self,
        user_id: UserId,
        kind: EngagementKind,
        page: PageRequest,
    ) -> Result<Page<EngagementRecord>> {
        self.read(|s| {
            let mut records: Vec<EngagementRecord> = s
                .relations
                .iter()
                .filter(|((user, _, k), _)| *user == user_id && *k == kind)
                .map(|((_, subject_id, _), at)| EngagementRecord {
                    subject_id: *subject_id,
                    kind,
                    created_at: *at,
                    subject: s.subjects.get(subject_id).cloned(),
                })
                .collect();
            records.sort_by(|a, b| {
                b.created_at
                    .cmp(&a.created_at)
                    .then(b.subject_id.cmp(&a.subject_id))
            });
            let total = records.len() as i64;
            let offset = usize::try_from(page.offset()).unwrap_or(usize::MAX);
            let items = records
                .into_iter()
                .skip(offset)
                .take(page.page_size as usize)
                .collect();
            Page {
                items,
                total,
                page: page.page,
                page_size: page.page_size,
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code
mod tests {
    use super::*;
    use crate::helpers::book;
    use chrono::TimeZone;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, day, 12, 0, 0).unwrap()
    }

    fn on(user: i64, subject: i64) -> PendingEvent {
        PendingEvent::new(
            UserId(user),
            SubjectId(subject),
            EngagementKind::Like,
            EngagementAction::On,
            at(5),
        )
    }

    #[tokio::test]
    async fn test_batch_is_idempotent() {
        let repo = MockEngagementRepository::with_subjects([book(7)]);
        let batch = [on(1, 7), on(2, 7)];

        let first = repo.apply_batch(EngagementKind::Like, &batch, &[]).await.unwrap();
        let second = repo.apply_batch(EngagementKind::Like, &batch, &[]).await.unwrap();

        assert_eq!(first.inserted, 2);
        assert_eq!(second.inserted, 0);
        assert_eq!(second.skipped, 2);
        assert_eq!(repo.durable_count(SubjectId(7), EngagementKind::Like), Some(2));
    }

    #[tokio::test]
    async fn test_failed_batch_applies_nothing() {
        let repo = MockEngagementRepository::with_subjects([book(7)]);
        repo.set_batch_failing(true);

        assert!(repo.apply_batch(EngagementKind::Like, &[on(1, 7)], &[]).await.is_err());
        assert!(!repo.has_relation(UserId(1), SubjectId(7), EngagementKind::Like));
        assert_eq!(repo.batch_calls(), 1);
    }

    #[tokio::test]
    async fn test_window_counts_exclude_boundaries() {
        let repo = MockEngagementRepository::new();
        repo.insert_relation(UserId(1), SubjectId(7), EngagementKind::Like, at(3));
        repo.insert_relation(UserId(2), SubjectId(7), EngagementKind::Like, at(4));
        repo.insert_relation(UserId(3), SubjectId(8), EngagementKind::Like, at(10));

        let counts = repo
            .count_created_between(EngagementKind::Like, at(3), at(10))
            .await
            .unwrap();
        assert_eq!(counts, vec![(SubjectId(7), 2)]);
    }

    #[tokio::test]
    async fn test_list_newest_first() {
        let repo = MockEngagementRepository::with_subjects([book(1), book(2)]);
        repo.insert_relation(UserId(1), SubjectId(1), EngagementKind::Like, at(3));
        repo.insert_relation(UserId(1), SubjectId(2), EngagementKind::Like, at(4));

        let page = repo
            .list_user_engagements(UserId(1), EngagementKind::Like, PageRequest::new(1, 1))
            .await
            .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].subject_id, SubjectId(2));
        assert_eq!(page.items[0].subject.as_ref().unwrap().title, "Book 2");
    }
}
