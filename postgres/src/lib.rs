//! # Shelfmark Postgres
//!
//! `PostgreSQL` store of record for the engagement pipeline.
//!
//! - [`PostgresEngagementRepository`]: relation tables, denormalised book
//!   counters, window counts for leaderboard rebuilds
//! - [`PostgresConfigRepository`]: the `system_configs` table read by the
//!   runtime's config cache
//!
//! Both share one [`sqlx::PgPool`]; [`PostgresEngagementRepository::migrate`]
//! creates every table they need.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod engagement;

pub use config::PostgresConfigRepository;
pub use engagement::PostgresEngagementRepository;
