//! Hardware playback clock abstraction.
//!
//! All control-plane timestamps are offsets from the clock's epoch (session start),
//! expressed as `Duration`. The playback scheduler maps chunks onto this timeline.

use crate::error::{DuplexError, DuplexResult};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Source of hardware playback time. Must be callable from the audio callback
/// (no locks, no allocation).
pub trait PlaybackClock: Send + Sync {
    /// Current position on the playback timeline. An error means the hardware
    /// clock is unavailable, which is fatal for the current turn.
    fn now(&self) -> DuplexResult<Duration>;
}

/// Monotonic clock anchored at construction time.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { epoch: Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackClock for MonotonicClock {
    fn now(&self) -> DuplexResult<Duration> {
        Ok(self.epoch.elapsed())
    }
}

/// Manually advanced clock for simulation and tests. Cloning shares the timeline.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    micros: Arc<AtomicU64>,
    unavailable: Arc<AtomicBool>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jump to an absolute position.
    pub fn set(&self, at: Duration) {
        self.micros.store(at.as_micros() as u64, Ordering::Release);
    }

    pub fn set_ms(&self, ms: u64) {
        self.set(Duration::from_millis(ms));
    }

    pub fn advance(&self, by: Duration) {
        self.micros.fetch_add(by.as_micros() as u64, Ordering::AcqRel);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.advance(Duration::from_millis(ms));
    }

    /// Simulate losing the audio hardware.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }
}

impl PlaybackClock for ManualClock {
    fn now(&self) -> DuplexResult<Duration> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(DuplexError::HardwareClock(
                "playback clock reported unavailable".to_string(),
            ));
        }
        Ok(Duration::from_micros(self.micros.load(Ordering::Acquire)))
    }
}

/// Milliseconds as used on the wire and in telemetry.
pub(crate) fn as_ms(d: Duration) -> u64 {
    d.as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_shares_timeline() {
        let clock = ManualClock::new();
        let other = clock.clone();
        clock.set_ms(100);
        other.advance_ms(50);
        assert_eq!(clock.now().unwrap(), Duration::from_millis(150));
    }

    #[test]
    fn unavailable_clock_is_fatal() {
        let clock = ManualClock::new();
        clock.set_unavailable(true);
        let err = clock.now().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn monotonic_clock_advances() {
        let clock = MonotonicClock::new();
        let a = clock.now().unwrap();
        let b = clock.now().unwrap();
        assert!(b >= a);
    }
}
