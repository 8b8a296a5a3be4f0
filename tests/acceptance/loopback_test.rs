//! Loopback acceptance tests.
//!
//! A client and a server stack joined by a simulated pipe must connect,
//! bridge pubsub topics both ways, and recover from lost frames and from a
//! lost link.
//!
//! # Acceptance Criteria
//!
//! - Both data-links connect within one settle pass of the reset handshake
//! - Retained server state reaches the client on connect without waiting
//!   for a flush
//! - Updates published on either side reach the other within one flush
//! - Dropped frames are retransmitted; the link stays up
//! - A link that stops delivering is declared lost and then re-established

use super::common::{Loopback, CLIENT_PREFIX, SERVER_PREFIX};
use serde_json::json;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_common::config::{Port0Mode, StackConfig};
use tether_common::error::StackError;
use tether_common::time::{duration_to_time, ManualClock, ManualCounter};
use tether_stack::simulated::{SimulatedLayers, SimulatedPipe, MAX_RETRANSMIT_ROUNDS};
use tether_stack::{Evm, PubSub, SharedEventManager, SharedPubSub, Stack};

const STEP: Duration = Duration::from_millis(5);

#[test]
fn test_stacks_connect_and_publish_state() {
    let mut lb = Loopback::new(&StackConfig::default());
    lb.connect();

    let client_state = format!("{CLIENT_PREFIX}0/state");
    let server_state = format!("{SERVER_PREFIX}0/state");
    assert_eq!(lb.client.value(&client_state), Some(json!("connected")));
    assert_eq!(lb.server.value(&server_state), Some(json!("connected")));

    lb.run_for(Duration::from_millis(20), STEP);
    assert_eq!(lb.server.value(&client_state), Some(json!("connected")));
    assert_eq!(lb.client.value(&server_state), Some(json!("connected")));
    assert_eq!(lb.client.status().stats.resets, 1);
}

#[test]
fn test_pubsub_updates_flow_both_ways() {
    let mut lb = Loopback::new(&StackConfig::default());
    lb.connect();

    lb.client.publish("app/temperature", json!(21.5));
    lb.server.publish("app/setpoint", json!({"value": 20, "unit": "C"}));
    lb.run_for(Duration::from_millis(20), STEP);

    assert_eq!(lb.server.value("app/temperature"), Some(json!(21.5)));
    assert_eq!(
        lb.client.value("app/setpoint"),
        Some(json!({"value": 20, "unit": "C"}))
    );

    // Remote values are not echoed back.
    lb.run_for(Duration::from_millis(20), STEP);
    assert!(!lb.client.pubsub.lock().unwrap().has_updates());
    assert!(!lb.server.pubsub.lock().unwrap().has_updates());
}

#[test]
fn test_retained_state_synced_on_connect() {
    let mut lb = Loopback::new(&StackConfig::default());
    lb.server.publish("cfg/rate", json!(5));
    lb.server.publish("cfg/name", json!("press-4"));

    // No clock advance: only the sync request can carry these.
    lb.connect();
    assert_eq!(lb.client.value("cfg/rate"), Some(json!(5)));
    assert_eq!(lb.client.value("cfg/name"), Some(json!("press-4")));
}

#[test]
fn test_recovers_from_dropped_frames() {
    let mut lb = Loopback::new(&StackConfig::default());
    lb.connect();
    lb.run_for(Duration::from_millis(20), STEP);

    lb.client.faults.drop_next(2);
    for i in 0..5 {
        lb.client.publish(&format!("app/sample/{i}"), json!(i));
    }
    lb.run_for(Duration::from_millis(100), STEP);

    for i in 0..5 {
        assert_eq!(lb.server.value(&format!("app/sample/{i}")), Some(json!(i)));
    }
    assert_eq!(lb.client.faults.dropped(), 2);
    assert!(lb.client.status().stats.retransmissions > 0);
    assert!(lb.client.status().connected);
    assert!(lb.server.status().connected);
}

#[test]
fn test_link_loss_and_reconnect() {
    let config = StackConfig::default();
    let mut lb = Loopback::new(&config);
    lb.connect();
    lb.run_for(Duration::from_millis(20), STEP);

    lb.client.faults.drop_next(u32::MAX);
    lb.client.publish("app/lost", json!(true));
    let give_up = config.link.tx_timeout * (MAX_RETRANSMIT_ROUNDS + 4);
    lb.run_for(give_up, STEP);

    let client_state = format!("{CLIENT_PREFIX}0/state");
    assert!(!lb.client.status().connected);
    assert_eq!(lb.client.value(&client_state), Some(json!("disconnected")));

    lb.client.faults.drop_next(0);
    lb.run_for(Duration::from_millis(50), STEP);
    assert!(lb.client.status().connected);
    assert!(lb.server.status().connected);
    assert_eq!(lb.client.value(&client_state), Some(json!("connected")));
    assert!(lb.server.status().stats.resets >= 2);

    lb.client.publish("app/after", json!(1));
    lb.run_for(Duration::from_millis(20), STEP);
    assert_eq!(lb.server.value("app/after"), Some(json!(1)));
}

#[test]
fn test_interval_next_tracks_flush_timer() {
    let config = StackConfig::default();
    let mut lb = Loopback::new(&config);
    lb.connect();

    let interval = lb.interval_next();
    assert!(interval > 0);
    assert!(interval <= duration_to_time(config.pubsub.flush_interval));

    lb.client.stack.finalize();
    lb.server.stack.finalize();
    assert_eq!(lb.interval_next(), tether_common::time::TIME_MAX);
}

#[test]
fn test_config_file_drives_loopback() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[link]
tx_frame_count = 16
tx_window_size = 4
tx_timeout = "5ms"

[pubsub]
flush_interval = "2ms"
"#
    )
    .unwrap();
    let config = StackConfig::from_file(file.path()).unwrap();
    config.validate().unwrap();
    assert_eq!(config.link.tx_window_size, 4);

    let mut lb = Loopback::new(&config);
    lb.connect();
    for i in 0..12 {
        lb.client.publish(&format!("burst/{i}"), json!(i));
    }
    lb.run_for(Duration::from_millis(10), Duration::from_millis(1));
    for i in 0..12 {
        assert_eq!(lb.server.value(&format!("burst/{i}")), Some(json!(i)));
    }
}

#[test]
fn test_unsupported_mode_is_rejected() {
    let config = StackConfig::from_toml("[port0]\nmode = \"observer\"\n").unwrap();
    assert_eq!(config.port0.mode, Port0Mode::Unsupported);

    let counter = Arc::new(ManualCounter::new(1000));
    let mut factory = SimulatedLayers::new(&config, counter);
    let evm: SharedEventManager = Arc::new(Evm::new(Arc::new(ManualClock::new(0))));
    let pubsub: SharedPubSub = Arc::new(Mutex::new(PubSub::new()));
    let (end, _peer) = SimulatedPipe::pair();
    let result = Stack::initialize(
        &mut factory,
        &config.link,
        config.port0.mode,
        "x/",
        evm,
        Box::new(end),
        pubsub,
    );
    assert!(matches!(result, Err(StackError::Config(_))));
}

#[test]
fn test_shipped_default_config_is_valid() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("config/default.toml");
    let config = StackConfig::from_file(&path).unwrap();
    config.validate().unwrap();
    assert_eq!(config.port0.mode, Port0Mode::Client);
    assert_eq!(config.link.tx_timeout, StackConfig::default().link.tx_timeout);
}
