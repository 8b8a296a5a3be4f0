//! Common utilities for acceptance tests.
//!
//! Provides a [`Loopback`] harness: a client stack and a server stack joined
//! by a simulated pipe, each with its own manual clock, driven step by step
//! the way a driver loop would drive them.

#![allow(dead_code)] // Not every helper is used by every test module

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_common::config::{Port0Mode, StackConfig};
use tether_common::time::{duration_to_time, ManualClock, ManualCounter, TimeSource, TIME_HOUR};
use tether_stack::simulated::{PipeFaults, SimulatedLayers, SimulatedPipe};
use tether_stack::{
    Evm, LinkStatus, PubSub, SharedEventManager, SharedPubSub, SharedTimeSync, Stack,
    TimeSyncRegistry,
};

/// Client counter frequency (1 MHz).
pub const COUNTER_HZ: u64 = 1_000_000;

/// Server clock reading at harness creation.
pub const SERVER_EPOCH: i64 = TIME_HOUR;

/// Topic prefix of the client's port0 topics.
pub const CLIENT_PREFIX: &str = "c/";

/// Topic prefix of the server's port0 topics.
pub const SERVER_PREFIX: &str = "s/";

/// One side of the loopback.
pub struct Side {
    pub stack: Stack,
    pub pubsub: SharedPubSub,
    pub clock: Arc<ManualClock>,
    pub faults: PipeFaults,
}

impl Side {
    /// Retained value of `topic`.
    pub fn value(&self, topic: &str) -> Option<serde_json::Value> {
        self.pubsub.lock().unwrap().query(topic).cloned()
    }

    /// Publish a local value.
    pub fn publish(&self, topic: &str, value: serde_json::Value) {
        self.pubsub.lock().unwrap().publish(topic, value);
    }

    /// Data-link status.
    pub fn status(&self) -> LinkStatus {
        self.stack.link_status().expect("stack is initialized")
    }
}

/// Client and server stacks over an in-memory pipe.
pub struct Loopback {
    pub client: Side,
    pub server: Side,
    pub counter: Arc<ManualCounter>,
    pub timesync: SharedTimeSync,
    pub registry: TimeSyncRegistry,
}

impl Loopback {
    /// Build both stacks with `config`; the config's mode is ignored.
    pub fn new(config: &StackConfig) -> Self {
        let counter = Arc::new(ManualCounter::new(COUNTER_HZ));
        let registry = TimeSyncRegistry::new();
        let timesync = registry.create(counter.clone());
        let (client_end, server_end) = SimulatedPipe::pair();
        let client_faults = client_end.faults();
        let server_faults = server_end.faults();

        let client_clock = Arc::new(ManualClock::new(0));
        let mut factory =
            SimulatedLayers::new(config, counter.clone()).with_timesync(timesync.clone());
        let (stack, pubsub) = build_stack(
            &mut factory,
            config,
            Port0Mode::Client,
            CLIENT_PREFIX,
            client_clock.clone(),
            Box::new(client_end),
        );
        let client = Side {
            stack,
            pubsub,
            clock: client_clock,
            faults: client_faults,
        };

        let server_clock = Arc::new(ManualClock::new(SERVER_EPOCH));
        let mut factory = SimulatedLayers::new(config, counter.clone());
        let (stack, pubsub) = build_stack(
            &mut factory,
            config,
            Port0Mode::Server,
            SERVER_PREFIX,
            server_clock.clone(),
            Box::new(server_end),
        );
        let server = Side {
            stack,
            pubsub,
            clock: server_clock,
            faults: server_faults,
        };

        Self {
            client,
            server,
            counter,
            timesync,
            registry,
        }
    }

    /// Run process rounds without advancing time.
    pub fn settle(&mut self) {
        for _ in 0..4 {
            self.client.stack.process();
            self.server.stack.process();
        }
    }

    /// Advance every clock and the counter by `dt`, then settle.
    pub fn step(&mut self, dt: Duration) {
        let delta = duration_to_time(dt);
        self.client.clock.advance(delta);
        self.server.clock.advance(delta);
        self.counter
            .advance(u64::try_from(dt.as_micros()).expect("step fits in u64"));
        self.settle();
    }

    /// Step repeatedly for `total` in increments of `dt`.
    pub fn run_for(&mut self, total: Duration, dt: Duration) {
        let mut elapsed = Duration::ZERO;
        while elapsed < total {
            self.step(dt);
            elapsed += dt;
        }
    }

    /// Settle until both data-links report connected.
    pub fn connect(&mut self) {
        self.settle();
        assert!(self.client.status().connected, "client did not connect");
        assert!(self.server.status().connected, "server did not connect");
    }

    /// Smallest `interval_next` of the two stacks.
    pub fn interval_next(&self) -> i64 {
        self.client
            .stack
            .interval_next()
            .min(self.server.stack.interval_next())
    }

    /// Synchronized time on the client minus the server's clock.
    pub fn sync_error(&self) -> i64 {
        let synced = self.timesync.lock().unwrap().time();
        synced - self.server.clock.now()
    }
}

fn build_stack(
    factory: &mut SimulatedLayers,
    config: &StackConfig,
    mode: Port0Mode,
    topic_prefix: &str,
    clock: Arc<ManualClock>,
    lower: Box<dyn tether_stack::LowerLevel>,
) -> (Stack, SharedPubSub) {
    let evm: SharedEventManager = Arc::new(Evm::new(clock));
    let pubsub: SharedPubSub = Arc::new(Mutex::new(PubSub::new()));
    let stack = Stack::initialize(
        factory,
        &config.link,
        mode,
        topic_prefix,
        evm,
        lower,
        pubsub.clone(),
    )
    .expect("stack initialization");
    (stack, pubsub)
}
