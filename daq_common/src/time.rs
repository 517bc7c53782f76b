//! Monotonic time sources.
//!
//! Slot timestamps live in shared memory and are compared by every process
//! attached to a segment, so the default clock is `CLOCK_MONOTONIC`, which is
//! system-wide on Linux rather than per-process like [`std::time::Instant`].

use nix::time::{ClockId, clock_gettime};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Source of monotonic microsecond timestamps.
pub trait TimeProvider: Send + Sync {
    /// Current time in microseconds.
    fn now_us(&self) -> u64;

    /// Current time in seconds.
    fn now_secs(&self) -> f64 {
        self.now_us() as f64 / 1_000_000.0
    }
}

/// System-wide monotonic clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl TimeProvider for MonotonicClock {
    fn now_us(&self) -> u64 {
        now_us()
    }
}

/// Manually advanced clock for deterministic tests of time-dependent logic.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_us: AtomicU64,
}

impl ManualClock {
    /// Create a clock reading `start_us`.
    pub fn new(start_us: u64) -> Arc<Self> {
        Arc::new(Self {
            now_us: AtomicU64::new(start_us),
        })
    }

    /// Move the clock forward.
    pub fn advance_us(&self, delta_us: u64) {
        self.now_us.fetch_add(delta_us, Ordering::AcqRel);
    }

    /// Set the clock to an absolute value.
    pub fn set_us(&self, value_us: u64) {
        self.now_us.store(value_us, Ordering::Release);
    }
}

impl TimeProvider for ManualClock {
    fn now_us(&self) -> u64 {
        self.now_us.load(Ordering::Acquire)
    }
}

/// Shared handle to the default clock.
pub fn default_clock() -> Arc<dyn TimeProvider> {
    Arc::new(MonotonicClock)
}

/// Read `CLOCK_MONOTONIC` in microseconds.
pub fn now_us() -> u64 {
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => ts.tv_sec() as u64 * 1_000_000 + ts.tv_nsec() as u64 / 1_000,
        Err(e) => {
            tracing::error!("clock_gettime(CLOCK_MONOTONIC) failed: {}", e);
            0
        }
    }
}

/// Read `CLOCK_MONOTONIC` in seconds.
pub fn now_secs() -> f64 {
    now_us() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_clock_advances() {
        let a = now_us();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = now_us();
        assert!(b >= a + 1_000);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(500);
        assert_eq!(clock.now_us(), 500);
        clock.advance_us(1_500);
        assert_eq!(clock.now_us(), 2_000);
        assert!((clock.now_secs() - 0.002).abs() < 1e-12);
        clock.set_us(7);
        assert_eq!(clock.now_us(), 7);
    }
}
