//! Link stack for device-to-host communication.
//!
//! This crate provides:
//! - [`layers`] with the traits each protocol layer implements
//! - [`stack`] with the [`Stack`] orchestrator that composes the layers
//! - [`timesync`] with the time synchronization engine and registry
//! - [`evm`] with a timer-driven [`EventManager`](layers::EventManager)
//! - [`pubsub`] with the retained-value topic store
//! - [`simulated`] with in-memory layers for tests and the daemon

pub mod evm;
pub mod layers;
pub mod pubsub;
#[cfg(feature = "simulated")]
pub mod simulated;
pub mod stack;
pub mod timesync;

pub use evm::Evm;
pub use layers::*;
pub use pubsub::PubSub;
pub use stack::Stack;
pub use timesync::{SharedTimeSync, TimeSync, TimeSyncClock, TimeSyncRegistry, TimeSyncStats};
