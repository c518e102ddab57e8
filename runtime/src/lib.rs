//! # Shelfmark Runtime
//!
//! Engines of the engagement pipeline, generic over the store traits in
//! `shelfmark-core`.
//!
//! ## Core Components
//!
//! - **[`ToggleEngine`]**: like/favorite state machine with a cache-first fast
//!   path and a relational fallback
//! - **[`ReconciliationPipeline`]**: workers draining the event logs into the
//!   relational store in batches
//! - **[`RankingEngine`]**: weekly and monthly leaderboards, rebuilt on miss
//!   and by the [`RebuildScheduler`]
//! - **[`TaskSupervisor`]**: named background tasks with cooperative shutdown
//!
//! ## Example
//!
//! ```ignore
//! use shelfmark_runtime::{ReconciliationPipeline, TaskSupervisor, ToggleEngine};
//!
//! let engine = ToggleEngine::new(store.clone(), repo.clone(), clock, config.clone());
//! let status = engine.toggle(UserId(1), SubjectId(7), EngagementKind::Like).await?;
//!
//! let mut supervisor = TaskSupervisor::new();
//! ReconciliationPipeline::new(store, repo, config).start(&mut supervisor).await?;
//! // ...
//! supervisor.shutdown(Duration::from_secs(10)).await?;
//! ```

/// Read-through configuration cache
pub mod config_cache;

/// Prometheus metrics for observability
pub mod metrics;

/// Write-behind reconciliation workers
pub mod pipeline;

/// Leaderboard reads and rebuilds
pub mod ranking;

/// Retry logic with exponential backoff
pub mod retry;

/// Periodic leaderboard rebuilds
pub mod scheduler;

/// Supervised background tasks and shutdown signalling
pub mod supervisor;

/// Like/favorite toggles
pub mod toggle;

pub use config_cache::ConfigCache;
pub use pipeline::{ReconciliationPipeline, SyncWorker};
pub use ranking::{RankedSubject, Ranking, RankingEngine};
pub use retry::{Backoff, RetryPolicy, retry_with_backoff};
pub use scheduler::RebuildScheduler;
pub use supervisor::{ShutdownSignal, TaskSupervisor, wait_for_signal};
pub use toggle::ToggleEngine;
