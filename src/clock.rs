//! Time source abstraction.
//!
//! Every cache and token check reads time through [`Clock`] so tests can pin
//! and advance it deterministically with [`ManualClock`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync + 'static {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;

    /// Current time as Unix seconds.
    fn unix_now(&self) -> i64 {
        self.now().timestamp()
    }
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Start at `now`.
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Start at the current system time, truncated to whole seconds.
    #[must_use]
    pub fn starting_now() -> Self {
        let now = Utc::now();
        Self::new(DateTime::from_timestamp(now.timestamp(), 0).unwrap_or(now))
    }

    /// Move forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = plus(*now, by);
    }

    /// Jump to `to`.
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// `at + by`, saturating at the maximum representable instant.
#[must_use]
pub fn plus(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(by)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Time elapsed from `since` to `now`; zero if `since` is in the future.
#[must_use]
pub fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_only_on_request() {
        let clock = ManualClock::starting_now();
        let start = clock.now();

        clock.advance(Duration::from_secs(90));

        assert_eq!(clock.now() - start, TimeDelta::seconds(90));
        assert_eq!(clock.unix_now(), start.timestamp() + 90);
    }

    #[test]
    fn elapsed_is_zero_for_future_instants() {
        let now = Utc::now();
        let later = plus(now, Duration::from_secs(5));
        assert_eq!(elapsed(later, now), Duration::ZERO);
        assert_eq!(elapsed(now, later), Duration::from_secs(5));
    }

    #[test]
    fn plus_saturates_instead_of_overflowing() {
        let at = DateTime::<Utc>::MAX_UTC;
        assert_eq!(plus(at, Duration::from_secs(1)), DateTime::<Utc>::MAX_UTC);
    }
}
