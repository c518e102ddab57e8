use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use shelfmark_core::environment::Clock;
use std::sync::{Arc, Mutex};

/// Fixed clock for deterministic tests
///
/// Always returns the same time.
///
/// # Example
///
/// ```
/// use shelfmark_testing::FixedClock;
/// use shelfmark_core::environment::Clock;
/// use chrono::Utc;
///
/// let clock = FixedClock::new(Utc::now());
/// assert_eq!(clock.now(), clock.now());
/// ```
#[derive(Debug, Clone)]
pub struct FixedClock {
    time: DateTime<Utc>,
}

impl FixedClock {
    /// Create a new fixed clock with the given time
    #[must_use]
    pub const fn new(time: DateTime<Utc>) -> Self {
        Self { time }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.time
    }
}

/// Clock that only moves when told to.
///
/// Clones share the same time, so a test can advance the clock an engine holds.
#[derive(Debug, Clone)]
pub struct ManualClock {
    time: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Create a clock starting at `time`.
    #[must_use]
    pub fn new(time: DateTime<Utc>) -> Self {
        Self {
            time: Arc::new(Mutex::new(time)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: TimeDelta) {
        if let Ok(mut time) = self.time.lock() {
            *time += by;
        }
    }

    /// Jump to an absolute time.
    pub fn set(&self, to: DateTime<Utc>) {
        if let Ok(mut time) = self.time.lock() {
            *time = to;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.time.lock().map_or_else(|p| *p.into_inner(), |t| *t)
    }
}

/// Create a default fixed clock for tests: Wednesday 2025-11-05 12:00:00 UTC,
/// inside ISO week `2025-W45` and month `2025-11`.
///
/// # Panics
///
/// Never in practice; the timestamp is hardcoded.
#[must_use]
#[allow(clippy::expect_used)]
pub fn test_clock() -> FixedClock {
    FixedClock::new(
        Utc.with_ymd_and_hms(2025, 11, 5, 12, 0, 0)
            .single()
            .expect("hardcoded timestamp should always be valid"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
    }

    #[test]
    fn test_manual_clock_shared_between_clones() {
        let clock = ManualClock::new(test_clock().now());
        let handle = clock.clone();
        handle.advance(TimeDelta::days(7));
        assert_eq!(clock.now(), test_clock().now() + TimeDelta::days(7));
    }
}
