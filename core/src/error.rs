//! Error types for engagement operations.

use thiserror::Error;

/// Result type alias for engagement operations.
pub type Result<T> = std::result::Result<T, EngagementError>;

/// Error taxonomy for the engagement pipeline.
///
/// Variants are grouped the way callers have to react to them: contention is
/// retried by the user, fast-store failures are recovered by falling back to
/// the relational store, and everything else is a system error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngagementError {
    // ═══════════════════════════════════════════════════════════
    // Contention
    // ═══════════════════════════════════════════════════════════

    /// Another toggle for the same (user, subject, kind) is in flight.
    #[error("Operation too frequent, please retry shortly")]
    TooFrequent,

    // ═══════════════════════════════════════════════════════════
    // Store Errors
    // ═══════════════════════════════════════════════════════════

    /// The fast store could not be reached or rejected the command.
    #[error("Fast store unavailable: {0}")]
    FastStore(String),

    /// The relational store of record failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Neither the event log nor the direct relational write accepted the change.
    #[error("Engagement could not be recorded durably: {0}")]
    Durability(String),

    /// One or more leaderboards could not be rebuilt.
    #[error("Failed to rebuild leaderboards: {}", failed.join(", "))]
    Rebuild {
        /// Leaderboards that failed, as `kind:period:key`
        failed: Vec<String>,
    },

    // ═══════════════════════════════════════════════════════════
    // Input / Encoding
    // ═══════════════════════════════════════════════════════════

    /// Caller supplied an unusable value (unknown kind, malformed period key).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A log entry or cached value could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invariant violation inside the engine.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// User-facing category of an [`EngagementError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Retry shortly ("too frequent").
    Contention,
    /// A backing service is down.
    Unavailable,
    /// The request itself is wrong.
    Invalid,
    /// Anything else.
    System,
}

impl EngagementError {
    /// Category used by the request layer to pick a message and status code.
    ///
    /// # Examples
    ///
    /// ```
    /// # use shelfmark_core::{EngagementError, ErrorCategory};
    /// assert_eq!(EngagementError::TooFrequent.category(), ErrorCategory::Contention);
    /// assert_eq!(
    ///     EngagementError::FastStore("timeout".into()).category(),
    ///     ErrorCategory::Unavailable
    /// );
    /// ```
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::TooFrequent => ErrorCategory::Contention,
            Self::FastStore(_) | Self::Database(_) | Self::Durability(_) => {
                ErrorCategory::Unavailable
            }
            Self::InvalidArgument(_) => ErrorCategory::Invalid,
            Self::Rebuild { .. } | Self::Serialization(_) | Self::Internal(_) => {
                ErrorCategory::System
            }
        }
    }

    /// Returns `true` if the fast store is the failing component.
    #[must_use]
    pub const fn is_fast_store(&self) -> bool {
        matches!(self, Self::FastStore(_))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code
mod tests {
    use super::*;

    #[test]
    fn test_rebuild_error_lists_failures() {
        let err = EngagementError::Rebuild {
            failed: vec!["like:week:2025-W45".into(), "favorite:month:2025-11".into()],
        };
        assert_eq!(
            err.to_string(),
            "Failed to rebuild leaderboards: like:week:2025-W45, favorite:month:2025-11"
        );
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            EngagementError::Database("x".into()).category(),
            ErrorCategory::Unavailable
        );
        assert_eq!(
            EngagementError::InvalidArgument("x".into()).category(),
            ErrorCategory::Invalid
        );
        assert_eq!(
            EngagementError::Internal("x".into()).category(),
            ErrorCategory::System
        );
        assert!(EngagementError::FastStore("x".into()).is_fast_store());
        assert!(!EngagementError::TooFrequent.is_fast_store());
    }
}
