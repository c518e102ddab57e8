//! # Shelfmark Core
//!
//! Domain types and seams for the book engagement pipeline.
//!
//! This crate owns everything the other crates agree on:
//!
//! - **Identifiers and events**: [`UserId`], [`SubjectId`], [`EngagementKind`],
//!   [`PendingEvent`]
//! - **Periods**: ISO week / calendar month keys and their time windows
//! - **Store traits**: [`FastStore`] (low-latency cache, leaderboards, event log,
//!   locks) and [`EngagementRepository`] (relational store of record)
//! - **Errors**: [`EngagementError`] with user-facing categories
//! - **Configuration**: [`EngagementConfig`] with the pipeline's tunables
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  toggle   ┌──────────────┐  append  ┌──────────────┐
//! │ Request layer│ ────────▶ │ Toggle engine│ ───────▶ │  Event log   │
//! └──────────────┘           └──────┬───────┘          └──────┬───────┘
//!                                   │ sets/counters/boards    │ consumer group
//!                                   ▼                         ▼
//!                            ┌──────────────┐          ┌──────────────┐
//!                            │  Fast store  │          │   Pipeline   │
//!                            └──────────────┘          └──────┬───────┘
//!                                   ▲ rebuild                 │ batch tx
//!                            ┌──────┴───────┐          ┌──────▼───────┐
//!                            │Ranking engine│ ◀─────── │  Relational  │
//!                            └──────────────┘          └──────────────┘
//! ```
//!
//! Implementations live in `shelfmark-redis`, `shelfmark-postgres` and
//! `shelfmark-testing`; the engines live in `shelfmark-runtime`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod engagement;
pub mod error;
pub mod fast_store;
pub mod period;
pub mod repository;

pub use config::EngagementConfig;
pub use engagement::{
    EngagementAction, EngagementKind, EngagementRecord, EngagementStatus, PendingEvent, Page,
    PageRequest, Subject, SubjectId, SubjectStatus, UserId,
};
pub use error::{EngagementError, ErrorCategory, Result};
pub use fast_store::{Cached, CachedCounts, FastStore, LockKey, LogConsumer, LogEntry};
pub use period::{LeaderboardKey, Period, PeriodType};
pub use repository::{BatchOutcome, ConfigRepository, EngagementRepository, SubjectCounters};

/// Environment traits injected into the engines.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// Period keys, event timestamps and rebuild windows are all derived from
    /// the injected clock, so tests can pin "now" to a known week.
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
