//! # Shelfmark Testing
//!
//! Testing utilities for the engagement pipeline.
//!
//! This crate provides:
//! - In-memory implementations of the store traits, with failure and latency
//!   injection ([`MockFastStore`], [`MockEngagementRepository`], [`MockConfigRepository`])
//! - Deterministic clocks ([`FixedClock`], [`ManualClock`])
//! - Fixtures and proptest strategies
//!
//! ## Example
//!
//! ```ignore
//! use shelfmark_testing::{MockEngagementRepository, MockFastStore, test_clock};
//!
//! #[tokio::test]
//! async fn test_toggle_on() {
//!     let engine = ToggleEngine::new(
//!         Arc::new(MockFastStore::new()),
//!         Arc::new(MockEngagementRepository::new()),
//!         Arc::new(test_clock()),
//!         EngagementConfig::default(),
//!     );
//!
//!     let status = engine.toggle(UserId(1), SubjectId(7), EngagementKind::Like).await?;
//!     assert!(status.engaged);
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod mocks;

/// Fixtures shared by engine and adapter tests.
pub mod helpers {
    use shelfmark_core::{Subject, SubjectId};

    /// A book row with zeroed counters.
    #[must_use]
    pub fn book(id: i64) -> Subject {
        Subject {
            id: SubjectId(id),
            title: format!("Book {id}"),
            author: format!("Author {id}"),
            like_count: 0,
            favorite_count: 0,
        }
    }

    /// Install a `tracing` subscriber for the current test binary.
    ///
    /// Safe to call from every test; only the first call installs.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::prelude::*;
    use shelfmark_core::{SubjectId, UserId};

    /// A sequence of toggles by a small population of users on a small set of
    /// subjects, so that keys repeat.
    pub fn toggle_sequence(max_len: usize) -> impl Strategy<Value = Vec<(UserId, SubjectId)>> {
        prop::collection::vec((1i64..=4, 1i64..=3), 0..=max_len).prop_map(|pairs| {
            pairs
                .into_iter()
                .map(|(user, subject)| (UserId(user), SubjectId(subject)))
                .collect()
        })
    }
}

// Re-export commonly used items
pub use mocks::{
    FixedClock, ManualClock, MockConfigRepository, MockEngagementRepository, MockFastStore,
    MockLogConsumer, test_clock,
};
