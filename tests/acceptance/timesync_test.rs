//! Time synchronization acceptance tests.
//!
//! The client's engine is fed by port0's round-trip exchange with the
//! server and must track the server clock.
//!
//! # Acceptance Criteria
//!
//! - The first response calibrates the engine to the server's time
//! - Periodic samples keep the error below one microsecond
//! - A step in the server clock is followed within one sync period
//! - The registry serves the engine until it is deregistered

use super::common::{Loopback, SERVER_EPOCH};
use std::time::Duration;
use tether_common::config::StackConfig;
use tether_common::time::{duration_to_time, TIME_MICROSECOND, TIME_SECOND};

#[test]
fn test_calibrates_on_connect() {
    let mut lb = Loopback::new(&StackConfig::default());
    assert!(!lb.timesync.lock().unwrap().is_calibrated());

    lb.connect();
    let engine = lb.timesync.lock().unwrap();
    assert!(engine.is_calibrated());
    assert_eq!(engine.time(), SERVER_EPOCH);
    assert_eq!(engine.stats().accepted, 1);
    assert_eq!(engine.stats().last_round_trip, Some(0));
    drop(engine);

    assert_eq!(lb.registry.time(), Some(SERVER_EPOCH));
}

#[test]
fn test_tracks_server_clock() {
    let config = StackConfig::default();
    let mut lb = Loopback::new(&config);
    lb.connect();

    let periods = 5;
    lb.run_for(
        config.port0.timesync_period * (periods + 1),
        Duration::from_millis(50),
    );

    let stats = lb.timesync.lock().unwrap().stats().clone();
    assert!(stats.accepted >= u64::from(periods));
    assert_eq!(stats.rejected, 0);
    assert!(stats.offset_range().is_some_and(|r| r < TIME_MICROSECOND));
    assert!(lb.sync_error().abs() < TIME_MICROSECOND);
}

#[test]
fn test_follows_server_clock_step() {
    let config = StackConfig::default();
    let mut lb = Loopback::new(&config);
    lb.connect();
    lb.run_for(Duration::from_millis(100), Duration::from_millis(50));

    lb.server.clock.advance(TIME_SECOND);
    assert!((lb.sync_error() + TIME_SECOND).abs() < TIME_MICROSECOND);

    lb.run_for(config.port0.timesync_period, Duration::from_millis(50));
    assert!(lb.sync_error().abs() < TIME_MICROSECOND);
    let last_offset = lb.timesync.lock().unwrap().stats().last_offset.unwrap();
    assert!((last_offset - TIME_SECOND).abs() < TIME_MICROSECOND);
}

#[test]
fn test_no_samples_while_disconnected() {
    let config = StackConfig::default();
    let mut lb = Loopback::new(&config);
    lb.connect();
    let accepted = lb.timesync.lock().unwrap().stats().accepted;

    lb.server.faults.drop_next(u32::MAX);
    lb.client.faults.drop_next(u32::MAX);
    lb.run_for(config.port0.timesync_period * 3, Duration::from_millis(50));

    assert!(!lb.client.status().connected);
    assert_eq!(lb.timesync.lock().unwrap().stats().accepted, accepted);

    // Free-running on the last anchor.
    let error = lb.sync_error();
    assert!(error.abs() < duration_to_time(Duration::from_millis(1)));
}

#[test]
fn test_registry_releases_engine() {
    let mut lb = Loopback::new(&StackConfig::default());
    lb.connect();
    assert!(lb.registry.current().is_some());

    assert!(lb.registry.deregister(&lb.timesync));
    assert_eq!(lb.registry.time(), None);
    // The stack keeps using its engine.
    lb.run_for(Duration::from_secs(2), Duration::from_millis(100));
    assert!(lb.timesync.lock().unwrap().stats().accepted >= 2);
}
