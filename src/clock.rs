//! Time sources for the tick engine.
//!
//! The scheduler samples wall-clock time through the [`TimeSource`] trait so
//! that it can run against real time in production ([`WallClock`]) or
//! against manually advanced time in tests ([`VirtualClock`]).
//!
//! A time source reports the elapsed time since its own epoch (usually its
//! creation). Only differences between two samples are ever used, so the
//! epoch itself is arbitrary; the source must be monotonic for the tick
//! engine to make progress, but short backwards steps are tolerated (see the
//! tick engine's bad-time handling).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A monotonic clock sampled by the tick engine.
pub trait TimeSource: Send + Sync {
    /// Returns the time elapsed since this source's epoch.
    fn now(&self) -> Duration;
}

/// Wall-clock time source for production use.
///
/// Backed by [`std::time::Instant`]; the epoch is the moment the clock was
/// created.
#[derive(Debug)]
pub struct WallClock {
    epoch: Instant,
}

impl WallClock {
    /// Creates a new wall clock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for WallClock {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }
}

/// Virtual time source for deterministic tests.
///
/// Time only moves when explicitly advanced, or set, which may go
/// backwards (useful for exercising the tick engine's bad-time recovery).
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use tickwheel::{TimeSource, VirtualClock};
///
/// let clock = VirtualClock::new();
/// assert_eq!(clock.now(), Duration::ZERO);
/// clock.advance(Duration::from_millis(10));
/// assert_eq!(clock.now(), Duration::from_millis(10));
/// ```
#[derive(Debug, Default)]
pub struct VirtualClock {
    nanos: AtomicU64,
}

impl VirtualClock {
    /// Creates a virtual clock starting at time zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nanos: AtomicU64::new(0),
        }
    }

    /// Advances time by `d`.
    pub fn advance(&self, d: Duration) {
        self.nanos.fetch_add(nanos_u64(d), Ordering::Release);
    }

    /// Sets the current time. May go backwards.
    pub fn set(&self, d: Duration) {
        self.nanos.store(nanos_u64(d), Ordering::Release);
    }
}

impl TimeSource for VirtualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::Acquire))
    }
}

fn nanos_u64(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_clock_starts_at_zero() {
        let clock = VirtualClock::new();
        assert_eq!(clock.now(), Duration::ZERO);
    }

    #[test]
    fn virtual_clock_advance_accumulates() {
        let clock = VirtualClock::new();
        clock.advance(Duration::from_millis(3));
        clock.advance(Duration::from_millis(4));
        assert_eq!(clock.now(), Duration::from_millis(7));
    }

    #[test]
    fn virtual_clock_set_may_go_backwards() {
        let clock = VirtualClock::new();
        clock.set(Duration::from_secs(100));
        clock.set(Duration::from_secs(50));
        assert_eq!(clock.now(), Duration::from_secs(50));
    }

    #[test]
    fn wall_clock_advances() {
        let clock = WallClock::new();
        let t1 = clock.now();
        std::thread::sleep(Duration::from_millis(5));
        let t2 = clock.now();
        assert!(t2 > t1);
    }
}
