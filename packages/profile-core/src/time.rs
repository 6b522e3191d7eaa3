//! Clocks.
//!
//! The fetch coordinator needs two notions of time: a monotonic clock for
//! cooldown and back-off windows, and a wall clock for the `last_fetch_at`
//! timestamps that are persisted with each profile.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Source of monotonic and wall-clock time
pub trait Clock: Send + Sync {
    /// Monotonic instant, used for in-memory windows
    fn now(&self) -> Instant;

    /// Wall-clock Unix timestamp in milliseconds, used for persisted fields
    fn wall_millis(&self) -> i64;
}

/// The real clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall_millis(&self) -> i64 {
        now_timestamp_millis()
    }
}

/// A clock that only moves when told to.
///
/// Both the monotonic and the wall reading advance together, so windows
/// computed from either agree.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    wall_base: i64,
    offset: Mutex<Duration>,
}

impl ManualClock {
    /// Create a manual clock starting at the current real time
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            wall_base: now_timestamp_millis(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }

    fn wall_millis(&self) -> i64 {
        self.wall_base + self.offset.lock().as_millis() as i64
    }
}

/// Returns the current Unix timestamp in milliseconds.
pub fn now_timestamp_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_timestamp_millis_is_reasonable() {
        let ts = now_timestamp_millis();
        // Should be after 2024-01-01 in millis
        assert!(ts > 1704067200_000, "Timestamp {} is too old", ts);
    }

    #[test]
    fn test_manual_clock_advances_both_readings() {
        let clock = ManualClock::new();
        let mono = clock.now();
        let wall = clock.wall_millis();

        clock.advance(Duration::from_secs(90));

        assert_eq!(clock.now() - mono, Duration::from_secs(90));
        assert_eq!(clock.wall_millis() - wall, 90_000);
    }
}
