//! Timer-driven event manager.
//!
//! [`Evm`] keeps one-shot timers ordered by deadline. Callbacks run outside
//! the internal lock, so a callback may schedule or cancel timers on the
//! same manager.

use crate::layers::{lock, EventId, EventManager, TimerCallback};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};
use tether_common::time::{TimeSource, TIME_MAX};
use tracing::trace;

#[derive(Default)]
struct EvmInner {
    timers: BTreeMap<(i64, EventId), TimerCallback>,
    deadlines: HashMap<EventId, i64>,
    next_id: u64,
}

/// Event manager over a [`TimeSource`].
pub struct Evm {
    clock: Arc<dyn TimeSource>,
    inner: Mutex<EvmInner>,
}

impl Evm {
    /// Create an event manager timestamping from `clock`.
    pub fn new(clock: Arc<dyn TimeSource>) -> Self {
        Self {
            clock,
            inner: Mutex::new(EvmInner::default()),
        }
    }

    /// Number of scheduled timers.
    pub fn pending(&self) -> usize {
        lock(&self.inner).timers.len()
    }

    /// Deadline of the earliest scheduled timer.
    pub fn next_deadline(&self) -> Option<i64> {
        lock(&self.inner)
            .timers
            .keys()
            .next()
            .map(|(deadline, _)| *deadline)
    }
}

impl fmt::Debug for Evm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Evm")
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

impl EventManager for Evm {
    fn timestamp(&self) -> i64 {
        self.clock.now()
    }

    fn schedule(&self, at: i64, callback: TimerCallback) -> EventId {
        let mut inner = lock(&self.inner);
        let id = EventId(inner.next_id);
        inner.next_id += 1;
        inner.timers.insert((at, id), callback);
        inner.deadlines.insert(id, at);
        trace!(id = id.0, at, "timer scheduled");
        id
    }

    fn cancel(&self, id: EventId) -> bool {
        let mut inner = lock(&self.inner);
        match inner.deadlines.remove(&id) {
            Some(at) => inner.timers.remove(&(at, id)).is_some(),
            None => false,
        }
    }

    fn interval_next(&self, now: i64) -> i64 {
        match self.next_deadline() {
            Some(deadline) => deadline.saturating_sub(now).max(0),
            None => TIME_MAX,
        }
    }

    fn process(&self, now: i64) -> usize {
        let due = {
            let mut inner = lock(&self.inner);
            let due = match now.checked_add(1) {
                Some(limit) => {
                    let later = inner.timers.split_off(&(limit, EventId(0)));
                    std::mem::replace(&mut inner.timers, later)
                }
                None => std::mem::take(&mut inner.timers),
            };
            for (_, id) in due.keys() {
                inner.deadlines.remove(id);
            }
            due
        };

        let count = due.len();
        for ((at, id), callback) in due {
            trace!(id = id.0, at, now, "timer fired");
            callback(now);
        }
        count
    }
}
