//! Time source for bounded waits.
//!
//! Every bounded wait in the fixtures and hooks computes one absolute
//! deadline from a [`Clock`] and polls against it.  Tests substitute
//! [`ManualClock`], whose `sleep` advances virtual time instantly, so
//! multi-minute timeouts are exercised without waiting.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// A source of monotonic time.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> Instant;

    /// Block the caller for `duration`.
    fn sleep(&self, duration: Duration);

    /// Absolute deadline `timeout` from now.
    fn deadline(&self, timeout: Duration) -> Instant {
        self.now() + timeout
    }

    /// Time left until `deadline`, or zero if it has passed.
    fn remaining(&self, deadline: Instant) -> Duration {
        deadline.saturating_duration_since(self.now())
    }
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Virtual time that only moves when slept on or advanced.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    elapsed: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
        }
    }

    /// Move time forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        *self.elapsed.lock() += duration;
    }

    /// Total virtual time elapsed since creation.
    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.elapsed.lock()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_on_sleep() {
        let clock = ManualClock::new();
        let start = clock.now();
        let deadline = clock.deadline(Duration::from_secs(60));

        clock.sleep(Duration::from_secs(45));
        assert_eq!(clock.now() - start, Duration::from_secs(45));
        assert_eq!(clock.remaining(deadline), Duration::from_secs(15));

        clock.advance(Duration::from_secs(30));
        assert_eq!(clock.remaining(deadline), Duration::ZERO);
        assert_eq!(clock.elapsed(), Duration::from_secs(75));
    }
}
