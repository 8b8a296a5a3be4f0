//! Time synchronization engine.
//!
//! Maps a free-running local tick counter onto a shared time base. Until the
//! first accepted sample the engine reports time since counter zero. Each
//! accepted sample re-anchors the mapping at the midpoint of the exchange:
//!
//! ```text
//!   counter:  send ─────────────── midpoint ─────────────── receive
//!   time:             lower ─────── midpoint ─────── upper
//! ```
//!
//! Path delay is assumed symmetric; the round trip is recorded in
//! [`TimeSyncStats`] so callers can judge sample quality.

use crate::layers::lock;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use tether_common::error::{StackError, StackResult};
use tether_common::time::{counter_to_time, time_to_counter, CounterSource, TimeSource};
use tracing::{debug, info, warn};

/// Engine shared between the stack, its layers and the application.
pub type SharedTimeSync = Arc<Mutex<TimeSync>>;

/// Synchronization quality counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TimeSyncStats {
    /// Accepted samples.
    pub accepted: u64,
    /// Rejected samples.
    pub rejected: u64,
    /// Offset applied by the last accepted sample (calibrated samples only).
    pub last_offset: Option<i64>,
    /// Smallest applied offset.
    pub min_offset: Option<i64>,
    /// Largest applied offset.
    pub max_offset: Option<i64>,
    /// Round trip of the last accepted sample.
    pub last_round_trip: Option<i64>,
}

impl TimeSyncStats {
    fn record(&mut self, offset: Option<i64>, round_trip: i64) {
        self.accepted += 1;
        self.last_round_trip = Some(round_trip);
        if let Some(offset) = offset {
            self.last_offset = Some(offset);
            self.min_offset = Some(self.min_offset.map_or(offset, |m| m.min(offset)));
            self.max_offset = Some(self.max_offset.map_or(offset, |m| m.max(offset)));
        }
    }

    /// Spread between the largest and smallest applied offset.
    pub fn offset_range(&self) -> Option<i64> {
        match (self.min_offset, self.max_offset) {
            (Some(min), Some(max)) => Some(max.saturating_sub(min)),
            _ => None,
        }
    }
}

/// Counter-to-time mapping with midpoint re-anchoring.
pub struct TimeSync {
    counter: Arc<dyn CounterSource>,
    frequency: u64,
    anchor_counter: u64,
    anchor_time: i64,
    calibrated: bool,
    stats: TimeSyncStats,
}

impl fmt::Debug for TimeSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeSync")
            .field("frequency", &self.frequency)
            .field("anchor_counter", &self.anchor_counter)
            .field("anchor_time", &self.anchor_time)
            .field("calibrated", &self.calibrated)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl TimeSync {
    /// Create an uncalibrated engine over `counter`.
    ///
    /// The counter frequency is read here and refreshed on every accepted
    /// sample.
    pub fn new(counter: Arc<dyn CounterSource>) -> Self {
        let frequency = counter.counter().frequency;
        if frequency == 0 {
            warn!("Time counter reports zero frequency; time will read as anchor only");
        }
        Self {
            counter,
            frequency,
            anchor_counter: 0,
            anchor_time: 0,
            calibrated: false,
            stats: TimeSyncStats::default(),
        }
    }

    /// Create a shared engine.
    pub fn shared(counter: Arc<dyn CounterSource>) -> SharedTimeSync {
        Arc::new(Mutex::new(Self::new(counter)))
    }

    /// Counter frequency in Hz.
    pub fn frequency(&self) -> u64 {
        self.frequency
    }

    /// Whether at least one sample was accepted.
    pub fn is_calibrated(&self) -> bool {
        self.calibrated
    }

    /// Current anchor as `(counter, time)`.
    pub fn anchor(&self) -> (u64, i64) {
        (self.anchor_counter, self.anchor_time)
    }

    /// Synchronization counters.
    pub fn stats(&self) -> &TimeSyncStats {
        &self.stats
    }

    /// Time corresponding to a counter reading.
    ///
    /// Readings before the anchor (within half the counter range) map to
    /// earlier times.
    pub fn time_at(&self, counter_value: u64) -> i64 {
        let ticks = counter_value.wrapping_sub(self.anchor_counter) as i64;
        self.anchor_time
            .saturating_add(counter_to_time(ticks, self.frequency))
    }

    /// Current time.
    pub fn time(&self) -> i64 {
        self.time_at(self.counter.counter().value)
    }

    /// Counter reading corresponding to `time`.
    pub fn counter_at(&self, time: i64) -> u64 {
        let ticks = time_to_counter(time.saturating_sub(self.anchor_time), self.frequency);
        self.anchor_counter.wrapping_add(ticks as u64)
    }

    /// Apply a synchronization sample.
    ///
    /// `counter_at_send` and `counter_at_receive` are local counter readings
    /// around a request; `time_lower` and `time_upper` bound the reference
    /// time at which the request was served.
    pub fn update(
        &mut self,
        counter_at_send: u64,
        time_lower: i64,
        time_upper: i64,
        counter_at_receive: u64,
    ) -> StackResult<()> {
        let frequency = self.counter.counter().frequency;
        if let Err(e) = Self::check_sample(
            frequency,
            counter_at_send,
            time_lower,
            time_upper,
            counter_at_receive,
        ) {
            self.stats.rejected += 1;
            warn!(
                counter_at_send,
                counter_at_receive,
                time_lower,
                time_upper,
                error = %e,
                "Time sample rejected"
            );
            return Err(e);
        }

        let ticks = counter_at_receive.wrapping_sub(counter_at_send);
        let counter_mid = counter_at_send.wrapping_add(ticks / 2);
        let time_mid = (i128::from(time_lower) + i128::from(time_upper)).div_euclid(2);
        // Mean of two i64 values floored toward the lower bound.
        let time_mid = time_mid as i64;

        let offset = time_mid.saturating_sub(self.time_at(counter_mid));
        let round_trip = counter_to_time(ticks as i64, frequency);

        self.frequency = frequency;
        self.anchor_counter = counter_mid;
        self.anchor_time = time_mid;

        if self.calibrated {
            self.stats.record(Some(offset), round_trip);
            debug!(offset, round_trip, "Time sample applied");
        } else {
            self.calibrated = true;
            self.stats.record(None, round_trip);
            info!(offset, round_trip, anchor_time = time_mid, "Time synchronized");
        }
        Ok(())
    }

    fn check_sample(
        frequency: u64,
        counter_at_send: u64,
        time_lower: i64,
        time_upper: i64,
        counter_at_receive: u64,
    ) -> StackResult<()> {
        if frequency == 0 {
            return Err(StackError::TimeSample("counter frequency is zero".into()));
        }
        if time_lower > time_upper {
            return Err(StackError::TimeSample(format!(
                "time bounds inverted: {time_lower} > {time_upper}"
            )));
        }
        if (counter_at_receive.wrapping_sub(counter_at_send) as i64) < 0 {
            return Err(StackError::TimeSample(format!(
                "receive counter {counter_at_receive} precedes send counter {counter_at_send}"
            )));
        }
        Ok(())
    }
}

/// Synchronized time as a [`TimeSource`], for clocking an event manager.
#[derive(Debug, Clone)]
pub struct TimeSyncClock(pub SharedTimeSync);

impl TimeSource for TimeSyncClock {
    fn now(&self) -> i64 {
        lock(&self.0).time()
    }
}

/// Process-wide access to the current time synchronization engine.
///
/// Holds at most one engine, weakly: dropping the last strong reference
/// deregisters it implicitly.
#[derive(Debug, Default)]
pub struct TimeSyncRegistry {
    current: Mutex<Option<Weak<Mutex<TimeSync>>>>,
}

impl TimeSyncRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an engine over `counter` and register it.
    pub fn create(&self, counter: Arc<dyn CounterSource>) -> SharedTimeSync {
        let engine = TimeSync::shared(counter);
        self.register(&engine);
        engine
    }

    /// Make `engine` the current engine, replacing any previous one.
    pub fn register(&self, engine: &SharedTimeSync) {
        let mut current = lock(&self.current);
        if current.as_ref().and_then(Weak::upgrade).is_some() {
            debug!("Replacing registered time sync engine");
        }
        *current = Some(Arc::downgrade(engine));
    }

    /// Clear the registry if `engine` is the current engine.
    pub fn deregister(&self, engine: &SharedTimeSync) -> bool {
        let mut current = lock(&self.current);
        let is_current = current
            .as_ref()
            .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(engine)));
        if is_current {
            *current = None;
        }
        is_current
    }

    /// The current engine, if one is registered and alive.
    pub fn current(&self) -> Option<SharedTimeSync> {
        lock(&self.current).as_ref().and_then(Weak::upgrade)
    }

    /// Current time from the registered engine.
    pub fn time(&self) -> Option<i64> {
        self.current().map(|engine| lock(&engine).time())
    }

    /// Time at `counter_value` from the registered engine.
    pub fn time_at(&self, counter_value: u64) -> Option<i64> {
        self.current().map(|engine| lock(&engine).time_at(counter_value))
    }
}
