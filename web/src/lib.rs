//! Axum request layer for the engagement pipeline.
//!
//! A thin shell over [`ToggleEngine`](shelfmark_runtime::ToggleEngine) and
//! [`RankingEngine`](shelfmark_runtime::RankingEngine): handlers parse the
//! path, query and `X-User-Id` header, call one engine operation and map
//! [`EngagementError`](shelfmark_core::EngagementError) categories to status
//! codes through [`AppError`].
//!
//! # Request Flow
//!
//! 1. **Extract** caller, kind, book id or query parameters
//! 2. **Validate** them (unknown kind or non-positive id is a 400)
//! 3. **Call** the engine
//! 4. **Map** the result to JSON or to an error response
//!
//! # Example
//!
//! ```ignore
//! use shelfmark_web::{AppState, router};
//!
//! let app = router(AppState::new(toggles, rankings, metrics));
//! axum::serve(listener, app).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod extractors;
pub mod handlers;
pub mod router;
pub mod state;

pub use error::AppError;
pub use extractors::{CallerId, USER_ID_HEADER};
pub use router::router;
pub use state::AppState;

/// Result type alias for web handlers.
pub type WebResult<T> = Result<T, AppError>;
