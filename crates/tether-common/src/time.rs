//! Fixed-point time and hardware tick counters.
//!
//! Time values are signed 64-bit fixed point with [`TIME_Q`] fractional
//! bits (34Q30): [`TIME_SECOND`] units make one second, giving a range of
//! roughly ±272 years at sub-nanosecond resolution.
//!
//! Tick counters are free-running `u64` values with a known frequency.
//! Counter differences use wrapping subtraction reinterpreted as `i64`, so
//! any two readings compared through this module must be less than half the
//! counter range apart.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Number of fractional bits in a fixed-point time value.
pub const TIME_Q: u32 = 30;
/// One second.
pub const TIME_SECOND: i64 = 1 << TIME_Q;
/// One millisecond, rounded to the nearest unit.
pub const TIME_MILLISECOND: i64 = (TIME_SECOND + 500) / 1000;
/// One microsecond, rounded to the nearest unit.
pub const TIME_MICROSECOND: i64 = (TIME_SECOND + 500_000) / 1_000_000;
/// One minute.
pub const TIME_MINUTE: i64 = TIME_SECOND * 60;
/// One hour.
pub const TIME_HOUR: i64 = TIME_MINUTE * 60;
/// One day.
pub const TIME_DAY: i64 = TIME_HOUR * 24;
/// Largest representable time, used as the "no work pending" interval.
pub const TIME_MAX: i64 = i64::MAX;

const NANOS_PER_SECOND: i128 = 1_000_000_000;

fn clamp_i64(value: i128) -> i64 {
    if value > i128::from(i64::MAX) {
        i64::MAX
    } else if value < i128::from(i64::MIN) {
        i64::MIN
    } else {
        value as i64
    }
}

/// Convert a signed tick count to fixed-point time.
///
/// Returns 0 when `frequency` is 0.
#[must_use]
pub fn counter_to_time(ticks: i64, frequency: u64) -> i64 {
    if frequency == 0 {
        return 0;
    }
    clamp_i64((i128::from(ticks) << TIME_Q) / i128::from(frequency))
}

/// Convert fixed-point time to a signed tick count at `frequency`.
#[must_use]
pub fn time_to_counter(time: i64, frequency: u64) -> i64 {
    clamp_i64((i128::from(time) * i128::from(frequency)) >> TIME_Q)
}

/// Convert a [`Duration`] to fixed-point time, saturating at [`TIME_MAX`].
#[must_use]
pub fn duration_to_time(duration: Duration) -> i64 {
    let nanos = i128::try_from(duration.as_nanos()).unwrap_or(i128::MAX >> TIME_Q);
    clamp_i64((nanos << TIME_Q) / NANOS_PER_SECOND)
}

/// Convert fixed-point time to a [`Duration`]; negative values become zero.
#[must_use]
pub fn time_to_duration(time: i64) -> Duration {
    if time <= 0 {
        return Duration::ZERO;
    }
    let nanos = (i128::from(time) * NANOS_PER_SECOND) >> TIME_Q;
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

/// Convert fixed-point time to floating-point seconds (for display).
#[must_use]
pub fn time_to_f64(time: i64) -> f64 {
    time as f64 / TIME_SECOND as f64
}

/// Snapshot of a free-running hardware tick counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeCounter {
    /// Ticks per second.
    pub frequency: u64,
    /// Current tick count (wraps).
    pub value: u64,
}

/// Platform source of tick counter snapshots.
pub trait CounterSource: Send + Sync {
    /// Read the counter.
    fn counter(&self) -> TimeCounter;
}

/// Monotonic counter backed by [`Instant`], ticking in nanoseconds.
#[derive(Debug, Clone, Copy)]
pub struct SystemCounter {
    start: Instant,
}

impl SystemCounter {
    /// Counter frequency in Hz.
    pub const FREQUENCY: u64 = 1_000_000_000;

    /// Create a counter starting at zero now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterSource for SystemCounter {
    fn counter(&self) -> TimeCounter {
        // Truncation to u64 is the counter wrap.
        let value = self.start.elapsed().as_nanos() as u64;
        TimeCounter {
            frequency: Self::FREQUENCY,
            value,
        }
    }
}

/// Settable counter for tests and simulation.
#[derive(Debug)]
pub struct ManualCounter {
    frequency: AtomicU64,
    value: AtomicU64,
}

impl ManualCounter {
    /// Create a counter at value 0 with the given frequency.
    #[must_use]
    pub fn new(frequency: u64) -> Self {
        Self {
            frequency: AtomicU64::new(frequency),
            value: AtomicU64::new(0),
        }
    }

    /// Set the counter value.
    pub fn set_value(&self, value: u64) {
        self.value.store(value, Ordering::Release);
    }

    /// Advance the counter by `ticks`, wrapping.
    pub fn advance(&self, ticks: u64) {
        // fetch_add wraps on overflow
        self.value.fetch_add(ticks, Ordering::AcqRel);
    }

    /// Change the reported frequency.
    pub fn set_frequency(&self, frequency: u64) {
        self.frequency.store(frequency, Ordering::Release);
    }
}

impl CounterSource for ManualCounter {
    fn counter(&self) -> TimeCounter {
        TimeCounter {
            frequency: self.frequency.load(Ordering::Acquire),
            value: self.value.load(Ordering::Acquire),
        }
    }
}

/// Source of fixed-point timestamps.
pub trait TimeSource: Send + Sync {
    /// Current time.
    fn now(&self) -> i64;
}

/// Monotonic clock reporting fixed-point time since an epoch offset.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    start: Instant,
    epoch: i64,
}

impl MonotonicClock {
    /// Create a clock that reads 0 now.
    #[must_use]
    pub fn new() -> Self {
        Self::with_epoch(0)
    }

    /// Create a clock that reads `epoch` now.
    #[must_use]
    pub fn with_epoch(epoch: i64) -> Self {
        Self {
            start: Instant::now(),
            epoch,
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicClock {
    fn now(&self) -> i64 {
        self.epoch
            .saturating_add(duration_to_time(self.start.elapsed()))
    }
}

/// Settable clock for tests and simulation.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    /// Create a clock reading `now`.
    #[must_use]
    pub fn new(now: i64) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    /// Set the current time.
    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::Release);
    }

    /// Advance the current time.
    pub fn advance(&self, delta: i64) {
        self.now.fetch_add(delta, Ordering::AcqRel);
    }
}

impl TimeSource for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::Acquire)
    }
}
