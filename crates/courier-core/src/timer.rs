//! Millisecond clocks for the throttle policies.
//!
//! Policies read time through [`Timer`] so tests can drive them with a
//! [`ManualTimer`] instead of sleeping.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic millisecond clock.
pub trait Timer: Send + Sync {
    fn millis(&self) -> u64;
}

/// Wall-clock backed timer, counting from first use in this process.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimer;

impl Timer for SystemTimer {
    fn millis(&self) -> u64 {
        static START: OnceLock<Instant> = OnceLock::new();
        let start = START.get_or_init(Instant::now);
        start.elapsed().as_millis() as u64
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualTimer {
    now: AtomicU64,
}

impl ManualTimer {
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Timer for ManualTimer {
    fn millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_timer_moves_on_demand() {
        let timer = ManualTimer::new(5);
        assert_eq!(timer.millis(), 5);
        timer.advance(10);
        assert_eq!(timer.millis(), 15);
        timer.set(3);
        assert_eq!(timer.millis(), 3);
    }

    #[test]
    fn system_timer_is_monotonic() {
        let a = SystemTimer.millis();
        let b = SystemTimer.millis();
        assert!(b >= a);
    }
}
