//! Wall-clock abstraction
//!
//! WAL offsets and record expiry both read time through a [`Clock`], so tests
//! can pin or advance time instead of sleeping.

use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;

    /// Nanoseconds since the Unix epoch (0 for times before it)
    fn now_nanos(&self) -> u64 {
        self.now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<SystemTime>,
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        match self.now.read() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

impl ManualClock {
    pub fn with_time(time: SystemTime) -> Self {
        Self {
            now: RwLock::new(time),
        }
    }

    /// Clock pinned at `nanos` after the Unix epoch
    pub fn at_nanos(nanos: u64) -> Self {
        Self::with_time(UNIX_EPOCH + Duration::from_nanos(nanos))
    }

    pub fn new() -> Self {
        Self::with_time(SystemTime::now())
    }

    pub fn advance(&self, duration: Duration) {
        let mut now = match self.now.write() {
            Ok(now) => now,
            Err(poisoned) => poisoned.into_inner(),
        };
        *now += duration;
    }

    pub fn set_time(&self, time: SystemTime) {
        let mut now = match self.now.write() {
            Ok(now) => now,
            Err(poisoned) => poisoned.into_inner(),
        };
        *now = time;
    }

    pub fn set_nanos(&self, nanos: u64) {
        self.set_time(UNIX_EPOCH + Duration::from_nanos(nanos));
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::at_nanos(100);
        assert_eq!(clock.now_nanos(), 100);
        clock.advance(Duration::from_nanos(5));
        assert_eq!(clock.now_nanos(), 105);
        clock.set_nanos(42);
        assert_eq!(clock.now_nanos(), 42);
    }

    #[test]
    fn test_system_clock_moves_forward() {
        let clock = SystemClock;
        let a = clock.now_nanos();
        let b = clock.now_nanos();
        assert!(a > 0);
        assert!(b >= a);
    }
}
