//! Periodic leaderboard refresh.

use crate::ranking::RankingEngine;
use crate::supervisor::ShutdownSignal;
use shelfmark_core::{EngagementRepository, FastStore, Result};
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{info, warn};

/// Calls [`RankingEngine::rebuild_all`] on a fixed interval.
///
/// The first rebuild runs one interval after start; boards missing before
/// then are rebuilt on read.
pub struct RebuildScheduler<S, R> {
    engine: RankingEngine<S, R>,
    every: Duration,
}

impl<S: FastStore, R: EngagementRepository> RebuildScheduler<S, R> {
    /// Create a scheduler firing every `every`.
    #[must_use]
    pub const fn new(engine: RankingEngine<S, R>, every: Duration) -> Self {
        Self { engine, every }
    }

    /// Run until shutdown. A rebuild in progress when the signal arrives is
    /// completed.
    ///
    /// # Errors
    ///
    /// Never returns an error; failed rebuilds are logged and retried on the
    /// next tick.
    pub async fn run(self, mut signal: ShutdownSignal) -> Result<()> {
        let mut ticker = interval(self.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        info!(interval_secs = self.every.as_secs(), "Rebuild scheduler started");

        loop {
            tokio::select! {
                () = signal.wait() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.engine.rebuild_all().await {
                        warn!(error = %e, "Scheduled leaderboard rebuild incomplete");
                    }
                }
            }
        }

        info!("Rebuild scheduler stopped");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code
mod tests {
    use super::*;
    use crate::supervisor::TaskSupervisor;
    use shelfmark_core::environment::Clock;
    use shelfmark_core::{
        EngagementConfig, EngagementKind, LeaderboardKey, Period, PeriodType, SubjectId, UserId,
    };
    use shelfmark_testing::{helpers::book, test_clock, MockEngagementRepository, MockFastStore};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_rebuilds_on_interval_and_stops() {
        let store = Arc::new(MockFastStore::new());
        let repo = Arc::new(MockEngagementRepository::with_subjects([book(1)]));
        repo.insert_relation(UserId(1), SubjectId(1), EngagementKind::Like, test_clock().now());
        let engine = RankingEngine::new(
            Arc::clone(&store),
            Arc::clone(&repo),
            Arc::new(test_clock()),
            EngagementConfig::default(),
        );
        let period = Period::containing(PeriodType::Week, test_clock().now()).unwrap();
        let board = LeaderboardKey::for_period(EngagementKind::Like, &period);

        let mut supervisor = TaskSupervisor::new();
        supervisor.spawn(
            "ranking-rebuild",
            RebuildScheduler::new(engine, Duration::from_secs(60)).run(supervisor.signal()),
        );

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!store.has_board(&board));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(store.board_score(&board, SubjectId(1)), Some(1));

        assert!(supervisor.shutdown(Duration::from_secs(1)).await.is_ok());
    }
}
