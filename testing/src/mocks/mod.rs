//! Mock implementations of the store and environment traits.
//!
//! All mocks share state through `Arc<Mutex<..>>`, so clones observe the same
//! data. That lets a test keep a handle for assertions while the engine under
//! test owns another.

mod clock;
mod config;
mod fast_store;
mod repository;

pub use clock::{FixedClock, ManualClock, test_clock};
pub use config::MockConfigRepository;
pub use fast_store::{MockFastStore, MockLogConsumer};
pub use repository::MockEngagementRepository;

use shelfmark_core::EngagementError;

fn poisoned<T>(_: T) -> EngagementError {
    EngagementError::Internal("Mutex lock failed".to_string())
}
