//! Injectable monotonic clock.
//!
//! Epoch boundaries in the time-series trackers are derived from a
//! cycle counter. The counter is injected at construction so tests can
//! substitute a scripted clock and advance time deterministically.

use core::time::Duration;

/// A monotonic cycle clock: a tick source plus its frequency.
#[derive(Clone, Copy)]
pub struct Clock {
    /// Current tick count. Must be monotonic.
    pub now: fn() -> i64,
    /// Ticks per second.
    pub freq: fn() -> f64,
}

impl Clock {
    /// Current tick count.
    #[inline]
    pub fn now(&self) -> i64 {
        (self.now)()
    }

    /// Convert a duration to ticks of this clock.
    #[inline]
    pub fn ticks_for(&self, d: Duration) -> i64 {
        (d.as_secs_f64() * (self.freq)()) as i64
    }

    /// Convert ticks of this clock to whole milliseconds.
    #[inline]
    pub fn ticks_to_ms(&self, ticks: i64) -> i64 {
        (ticks as f64 / (self.freq)() * 1000.0) as i64
    }
}

impl core::fmt::Debug for Clock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Clock").finish_non_exhaustive()
    }
}
