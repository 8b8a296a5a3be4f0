//! Workspace acceptance tests for the tether stack.
//!
//! These tests drive a client and a server stack over an in-memory pipe
//! with manual clocks, so they are deterministic and need no privileges:
//! - Link establishment, retransmission and link loss recovery
//! - Pubsub bridging in both directions
//! - Time synchronization accuracy

mod common;
mod loopback_test;
mod timesync_test;
