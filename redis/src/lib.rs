//! # Shelfmark Redis
//!
//! Redis implementation of the [`FastStore`](shelfmark_core::FastStore)
//! contract: per-user membership sorted sets, per-book counter hashes,
//! weekly/monthly leaderboards, one event stream per engagement kind with a
//! consumer group, and `SET NX PX` locks.
//!
//! Conditional updates (add-if-warm, increment-if-present,
//! increment-if-board-exists) run as Lua scripts; multi-key replacements run
//! as `MULTI` pipelines.
//!
//! # Example
//!
//! ```no_run
//! use shelfmark_redis::RedisFastStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = RedisFastStore::new("redis://127.0.0.1:6379").await?;
//! store.ping().await?;
//! # Ok(())
//! # }
//! ```

mod consumer;
pub mod keys;
mod store;

pub use consumer::RedisLogConsumer;
pub use store::RedisFastStore;
