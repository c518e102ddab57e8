//! Integration tests for the reconciliation pipeline.
//!
//! Toggles go through the engine onto the in-memory log; workers are driven
//! either one iteration at a time (`poll_once`) or as supervised tasks.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use shelfmark_core::environment::Clock;
use shelfmark_core::{
    EngagementConfig, EngagementKind, FastStore, PeriodType, SubjectId, UserId,
};
use shelfmark_runtime::{RankingEngine, ReconciliationPipeline, TaskSupervisor, ToggleEngine};
use shelfmark_testing::helpers::book;
use shelfmark_testing::{MockEngagementRepository, MockFastStore, test_clock};
use std::sync::Arc;
use std::time::Duration;

const LIKE: EngagementKind = EngagementKind::Like;
const B7: SubjectId = SubjectId(7);

// ============================================================================
// Test Fixtures
// ============================================================================

struct Harness {
    store: Arc<MockFastStore>,
    repo: Arc<MockEngagementRepository>,
    toggles: ToggleEngine<MockFastStore, MockEngagementRepository>,
    pipeline: ReconciliationPipeline<MockFastStore, MockEngagementRepository>,
    config: EngagementConfig,
}

fn harness(config: EngagementConfig) -> Harness {
    let store = Arc::new(MockFastStore::new());
    let repo = Arc::new(MockEngagementRepository::with_subjects((1..=10).map(book)));
    let toggles = ToggleEngine::new(
        Arc::clone(&store),
        Arc::clone(&repo),
        Arc::new(test_clock()),
        config.clone(),
    );
    let pipeline = ReconciliationPipeline::new(Arc::clone(&store), Arc::clone(&repo), config.clone());
    Harness {
        store,
        repo,
        toggles,
        pipeline,
        config,
    }
}

fn fast_config() -> EngagementConfig {
    EngagementConfig::default()
        .with_block_timeout(Duration::from_millis(10))
        .with_pending_timeout(Duration::ZERO)
}

impl Harness {
    async fn ensure_groups(&self) {
        for kind in EngagementKind::ALL {
            self.store
                .ensure_group(kind, &self.config.consumer_group)
                .await
                .unwrap();
        }
    }

    /// Run worker 0 of `kind` until an iteration finds nothing.
    async fn drain(&self, kind: EngagementKind) {
        let mut worker = self.pipeline.worker(kind, 0).await.unwrap();
        while worker.poll_once().await.unwrap() > 0 {}
    }
}

// ============================================================================
// Convergence
// ============================================================================

#[tokio::test]
async fn test_drained_pipeline_matches_toggles() {
    let h = harness(fast_config());
    h.ensure_groups().await;

    for user in 1..=5 {
        h.toggles.toggle(UserId(user), B7, LIKE).await.unwrap();
    }
    // Users 2 and 4 change their minds.
    h.toggles.toggle(UserId(2), B7, LIKE).await.unwrap();
    h.toggles.toggle(UserId(4), B7, LIKE).await.unwrap();
    h.toggles
        .toggle(UserId(1), SubjectId(3), EngagementKind::Favorite)
        .await
        .unwrap();

    h.drain(LIKE).await;
    h.drain(EngagementKind::Favorite).await;

    assert_eq!(h.repo.durable_count(B7, LIKE), Some(3));
    for user in [1, 3, 5] {
        assert!(h.repo.has_relation(UserId(user), B7, LIKE));
    }
    for user in [2, 4] {
        assert!(!h.repo.has_relation(UserId(user), B7, LIKE));
    }
    assert!(h.repo.has_relation(UserId(1), SubjectId(3), EngagementKind::Favorite));
    assert_eq!(h.store.pending_len(LIKE, &h.config.consumer_group), 0);

    // Cached counters were dropped and reseed from the durable ones.
    assert_eq!(h.store.cached_count(B7, LIKE), None);
    let status = h.toggles.status(UserId(9), B7, LIKE).await.unwrap();
    assert_eq!(status.count, 3);
}

#[tokio::test]
async fn test_batch_collapses_repeated_toggles() {
    let h = harness(fast_config());
    h.ensure_groups().await;

    for _ in 0..3 {
        h.toggles.toggle(UserId(1), B7, LIKE).await.unwrap();
    }
    h.drain(LIKE).await;

    assert!(h.repo.has_relation(UserId(1), B7, LIKE));
    assert_eq!(h.repo.durable_count(B7, LIKE), Some(1));
    assert_eq!(h.repo.batch_calls(), 1);
}

#[tokio::test]
async fn test_duplicate_delivery_does_not_double_count() {
    let h = harness(fast_config());
    h.ensure_groups().await;

    h.toggles.toggle(UserId(1), B7, LIKE).await.unwrap();
    h.drain(LIKE).await;

    // Redeliver the same event, twice.
    let event = h.store.logged_events(LIKE).remove(0);
    h.store.append_event(&event).await.unwrap();
    h.store.append_event(&event).await.unwrap();
    h.drain(LIKE).await;

    assert!(h.repo.has_relation(UserId(1), B7, LIKE));
    assert_eq!(h.repo.durable_count(B7, LIKE), Some(1));
}

#[tokio::test]
async fn test_ranking_after_drain_matches_relational_counts() {
    let h = harness(fast_config());
    h.ensure_groups().await;
    for (user, subject) in [(1, 1), (2, 1), (3, 1), (1, 2), (2, 2), (1, 3)] {
        h.toggles
            .toggle(UserId(user), SubjectId(subject), LIKE)
            .await
            .unwrap();
    }
    h.drain(LIKE).await;

    let ranking = RankingEngine::new(
        Arc::clone(&h.store),
        Arc::clone(&h.repo),
        Arc::new(test_clock()),
        h.config.clone(),
    )
    .ranking(LIKE, PeriodType::Week, Some(10))
    .await
    .unwrap();

    let scores: Vec<(usize, i64, i64)> = ranking
        .items
        .iter()
        .map(|item| (item.rank, item.subject_id.0, item.score))
        .collect();
    assert_eq!(scores, vec![(1, 1, 3), (2, 2, 2), (3, 3, 1)]);
    for item in &ranking.items {
        assert_eq!(h.repo.durable_count(item.subject_id, LIKE), Some(item.score));
    }
    assert_eq!(ranking.period_key, "2025-W45");
    assert_eq!(ranking.updated_at, test_clock().now());
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_failed_batch_is_left_pending_and_reclaimed() {
    let h = harness(fast_config());
    h.ensure_groups().await;
    h.toggles.toggle(UserId(1), B7, LIKE).await.unwrap();

    h.repo.set_batch_failing(true);
    let mut first = h.pipeline.worker(LIKE, 0).await.unwrap();
    assert!(first.poll_once().await.is_err());
    assert!(!h.repo.has_relation(UserId(1), B7, LIKE));
    assert_eq!(h.store.pending_len(LIKE, &h.config.consumer_group), 1);
    assert_eq!(h.store.undelivered_len(LIKE, &h.config.consumer_group), 0);

    // Another worker picks the stale entry up.
    h.repo.set_batch_failing(false);
    let mut second = h.pipeline.worker(LIKE, 1).await.unwrap();
    assert_eq!(second.poll_once().await.unwrap(), 1);
    assert!(h.repo.has_relation(UserId(1), B7, LIKE));
    assert_eq!(h.store.pending_len(LIKE, &h.config.consumer_group), 0);
}

#[tokio::test]
async fn test_entries_are_not_reclaimed_before_timeout() {
    let h = harness(fast_config().with_pending_timeout(Duration::from_secs(30)));
    h.ensure_groups().await;
    h.toggles.toggle(UserId(1), B7, LIKE).await.unwrap();

    h.repo.set_batch_failing(true);
    let mut worker = h.pipeline.worker(LIKE, 0).await.unwrap();
    assert!(worker.poll_once().await.is_err());

    h.repo.set_batch_failing(false);
    assert_eq!(worker.poll_once().await.unwrap(), 0);
    assert_eq!(h.store.pending_len(LIKE, &h.config.consumer_group), 1);
}

#[tokio::test]
async fn test_malformed_entries_are_dropped_and_acknowledged() {
    let h = harness(fast_config());
    h.ensure_groups().await;
    h.store.append_raw(LIKE, &[("user_id", "abc"), ("book_id", "7")]);
    h.toggles.toggle(UserId(1), B7, LIKE).await.unwrap();

    let mut worker = h.pipeline.worker(LIKE, 0).await.unwrap();
    assert_eq!(worker.poll_once().await.unwrap(), 2);

    assert!(h.repo.has_relation(UserId(1), B7, LIKE));
    assert_eq!(h.store.pending_len(LIKE, &h.config.consumer_group), 0);
}

#[tokio::test]
async fn test_log_read_failure_is_an_iteration_error() {
    let h = harness(fast_config());
    h.ensure_groups().await;
    h.store.set_log_read_failing(true);

    let mut worker = h.pipeline.worker(LIKE, 0).await.unwrap();
    assert!(worker.poll_once().await.is_err());
}

// ============================================================================
// Supervised workers
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_start_spawns_workers_and_drains_log() {
    let h = harness(fast_config());
    let mut supervisor = TaskSupervisor::new();

    let spawned = h.pipeline.start(&mut supervisor).await.unwrap();
    assert_eq!(spawned, 4);
    assert_eq!(supervisor.len(), 4);

    for user in 1..=10 {
        h.toggles.toggle(UserId(user), B7, LIKE).await.unwrap();
    }

    let mut applied = false;
    for _ in 0..200 {
        if h.repo.durable_count(B7, LIKE) == Some(10) {
            applied = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(applied, "pipeline did not drain the log");

    assert!(supervisor.shutdown(Duration::from_secs(5)).await.is_ok());
}

fn assert_send<T: Send>(_: &T) {}

#[tokio::test]
async fn test_worker_loop_can_run_on_any_thread() {
    let h = harness(fast_config());
    let supervisor = TaskSupervisor::new();
    let worker = h.pipeline.worker(LIKE, 0).await.unwrap();

    let run = worker.run(supervisor.signal());
    assert_send(&run);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_finishes_in_flight_batch() {
    let h = harness(fast_config().with_block_timeout(Duration::from_millis(50)));
    for user in 1..=5 {
        h.toggles.toggle(UserId(user), B7, LIKE).await.unwrap();
    }

    // Every fast-store call now takes a while, so the first iteration is
    // still running when shutdown is requested.
    h.store.set_latency(Duration::from_millis(100));
    let mut supervisor = TaskSupervisor::new();
    h.pipeline.start(&mut supervisor).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert!(supervisor.shutdown(Duration::from_secs(5)).await.is_ok());

    assert_eq!(h.repo.durable_count(B7, LIKE), Some(5));
    assert_eq!(h.store.pending_len(LIKE, &h.config.consumer_group), 0);
    assert_eq!(h.store.undelivered_len(LIKE, &h.config.consumer_group), 0);
}
