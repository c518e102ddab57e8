//! Leaderboards per engagement kind and period.
//!
//! Reads are served from the fast store. A missing board is rebuilt from the
//! relational store under a rebuild lock; the scheduler refreshes all boards
//! periodically through [`RankingEngine::rebuild_all`]. Read failures degrade
//! to an empty ranking rather than an error.

use crate::metrics::RankingMetrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shelfmark_core::environment::Clock;
use shelfmark_core::{
    EngagementConfig, EngagementError, EngagementKind, EngagementRepository, FastStore,
    LeaderboardKey, LockKey, Period, PeriodType, Result, Subject, SubjectId,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// One position on a leaderboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedSubject {
    /// 1-based position
    pub rank: usize,
    /// Book id
    #[serde(rename = "book_id")]
    pub subject_id: SubjectId,
    /// Book details
    #[serde(rename = "book")]
    pub subject: Subject,
    /// Relations created inside the period
    pub score: i64,
}

/// A leaderboard snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ranking {
    /// Like or favorite
    #[serde(rename = "type")]
    pub kind: EngagementKind,
    /// Week or month
    #[serde(rename = "period")]
    pub period_type: PeriodType,
    /// Period key the board belongs to
    pub period_key: String,
    /// Ranked subjects, best first
    pub items: Vec<RankedSubject>,
    /// Number of items
    pub total: usize,
    /// Time the snapshot was produced
    pub updated_at: DateTime<Utc>,
}

impl Ranking {
    fn empty(period: &Period, kind: EngagementKind, now: DateTime<Utc>) -> Self {
        Self {
            kind,
            period_type: period.period_type,
            period_key: period.key.clone(),
            items: Vec::new(),
            total: 0,
            updated_at: now,
        }
    }
}

/// Serves and rebuilds leaderboards.
pub struct RankingEngine<S, R> {
    store: Arc<S>,
    repo: Arc<R>,
    clock: Arc<dyn Clock>,
    config: EngagementConfig,
}

impl<S, R> Clone for RankingEngine<S, R> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            repo: Arc::clone(&self.repo),
            clock: Arc::clone(&self.clock),
            config: self.config.clone(),
        }
    }
}

impl<S: FastStore, R: EngagementRepository> RankingEngine<S, R> {
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

    /// Current leaderboard of `kind` for the period containing now.
    ///
    /// `limit` is clamped to `[1, max_ranking_limit]`; `None` asks for the
    /// maximum. Ties are ordered by subject id. Subjects that no longer exist
    /// are left out and ranks close up behind them.
    ///
    /// # Errors
    ///
    /// Returns error only if the current period cannot be computed. Store
    /// failures yield an empty ranking.
    pub async fn ranking(
        &self,
        kind: EngagementKind,
        period_type: PeriodType,
        limit: Option<usize>,
    ) -> Result<Ranking> {
        let now = self.clock.now();
        let period = Period::containing(period_type, now)?;
        let board = LeaderboardKey::for_period(kind, &period);
        let limit = self.config.clamp_limit(limit);

        let entries = match self.read_or_rebuild(&board, &period, limit).await {
            Ok(entries) => entries,
            Err(e) => {
                RankingMetrics::record_degraded();
                warn!(board = %board, error = %e, "Ranking unavailable, returning empty list");
                return Ok(Ranking::empty(&period, kind, now));
            }
        };
        if entries.is_empty() {
            return Ok(Ranking::empty(&period, kind, now));
        }

        let ids: Vec<SubjectId> = entries.iter().map(|(id, _)| *id).collect();
        let subjects = match self.repo.subjects(&ids).await {
            Ok(subjects) => subjects,
            Err(e) => {
                RankingMetrics::record_degraded();
                warn!(board = %board, error = %e, "Failed to load ranked books");
                return Ok(Ranking::empty(&period, kind, now));
            }
        };
        let mut by_id: HashMap<SubjectId, Subject> =
            subjects.into_iter().map(|subject| (subject.id, subject)).collect();

        let items: Vec<RankedSubject> = entries
            .into_iter()
            .filter_map(|(subject_id, score)| {
                by_id.remove(&subject_id).map(|subject| (subject_id, subject, score))
            })
            .enumerate()
            .map(|(index, (subject_id, subject, score))| RankedSubject {
                rank: index + 1,
                subject_id,
                subject,
                score,
            })
            .collect();

        Ok(Ranking {
            kind,
            period_type,
            period_key: period.key,
            total: items.len(),
            items,
            updated_at: now,
        })
    }

    /// Rebuild the current board of `kind` × `period_type` from the
    /// relational store.
    ///
    /// # Returns
    ///
    /// `false` if another rebuild of the same board is in progress.
    ///
    /// # Errors
    ///
    /// Returns error if either store fails.
    pub async fn rebuild(&self, kind: EngagementKind, period_type: PeriodType) -> Result<bool> {
        let period = Period::containing(period_type, self.clock.now())?;
        let board = LeaderboardKey::for_period(kind, &period);
        self.rebuild_locked(&board, &period).await
    }

    /// Rebuild every current board. All four are attempted even if some fail.
    ///
    /// # Errors
    ///
    /// Returns [`EngagementError::Rebuild`] naming the boards that failed.
    pub async fn rebuild_all(&self) -> Result<()> {
        let mut failed = Vec::new();
        for kind in EngagementKind::ALL {
            for period_type in PeriodType::ALL {
                match self.rebuild(kind, period_type).await {
                    Ok(true) => RankingMetrics::record_rebuild(true),
                    Ok(false) => {
                        debug!(kind = %kind, period = %period_type, "Rebuild already running, skipped");
                    }
                    Err(e) => {
                        RankingMetrics::record_rebuild(false);
                        error!(kind = %kind, period = %period_type, error = %e, "Leaderboard rebuild failed");
                        failed.push(format!("{kind}:{period_type}"));
                    }
                }
            }
        }
        if failed.is_empty() {
            info!("All leaderboards rebuilt");
            Ok(())
        } else {
            Err(EngagementError::Rebuild { failed })
        }
    }

    async fn read_or_rebuild(
        &self,
        board: &LeaderboardKey,
        period: &Period,
        limit: usize,
    ) -> Result<Vec<(SubjectId, i64)>> {
        let entries = self.store.top_scores(board, limit).await?;
        if !entries.is_empty() {
            return Ok(entries);
        }

        debug!(board = %board, "Leaderboard missing, rebuilding");
        if !self.rebuild_locked(board, period).await? {
            debug!(board = %board, "Rebuild in progress elsewhere");
            return Ok(Vec::new());
        }
        RankingMetrics::record_rebuild(true);
        self.store.top_scores(board, limit).await
    }

    async fn rebuild_locked(&self, board: &LeaderboardKey, period: &Period) -> Result<bool> {
        let lock = LockKey::Rebuild(board.clone());
        if !self.store.try_lock(&lock, self.config.rebuild_lock_ttl).await? {
            return Ok(false);
        }
        let result = self.replace_from_relations(board, period).await;
        if let Err(e) = self.store.unlock(&lock).await {
            debug!(board = %board, error = %e, "Failed to release rebuild lock, it will expire");
        }
        result.map(|()| true)
    }

    async fn replace_from_relations(&self, board: &LeaderboardKey, period: &Period) -> Result<()> {
        let counts = self
            .repo
            .count_created_between(board.kind, period.start, period.end)
            .await?;
        self.store
            .replace_leaderboard(board, &counts, self.config.board_ttl(period.period_type))
            .await?;
        info!(board = %board, entries = counts.len(), "Leaderboard rebuilt");
        Ok(())
    }
}
