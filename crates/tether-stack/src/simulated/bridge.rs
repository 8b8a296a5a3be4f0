//! Simulated pubsub bridge.
//!
//! An update message is the topic, a NUL byte, then the JSON value. The
//! upstream side asks for a full sync on connect; the downstream side
//! answers with every retained value.

use crate::layers::{
    lock, EventId, LinkEvent, PortHandler, PortSink, PubSubBridge, SharedEventManager,
    SharedPubSub,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, Weak};
use tether_common::config::PubSubDirection;
use tether_common::error::{StackError, StackResult};
use tracing::{debug, trace, warn};

/// Topic update.
pub const OP_UPDATE: u16 = 1;
/// Request for every retained value.
pub const OP_SYNC_REQ: u16 = 2;

/// Bridge counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BridgeStats {
    /// Updates sent to the peer.
    pub tx_updates: u64,
    /// Updates that could not be sent and were requeued.
    pub tx_deferred: u64,
    /// Updates received from the peer.
    pub rx_updates: u64,
    /// Malformed messages received.
    pub rx_errors: u64,
}

fn encode_update(topic: &str, value: &Value) -> StackResult<Vec<u8>> {
    let mut msg = topic.as_bytes().to_vec();
    msg.push(0);
    serde_json::to_writer(&mut msg, value).map_err(|e| StackError::Protocol(e.to_string()))?;
    Ok(msg)
}

fn decode_update(msg: &[u8]) -> StackResult<(&str, Value)> {
    let split = msg
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| StackError::Protocol("update without topic terminator".into()))?;
    let topic = std::str::from_utf8(&msg[..split])
        .map_err(|e| StackError::Protocol(format!("topic is not UTF-8: {e}")))?;
    let value =
        serde_json::from_slice(&msg[split + 1..]).map_err(|e| StackError::Protocol(e.to_string()))?;
    Ok((topic, value))
}

/// Pubsub bridge for [`SimulatedLayers`](super::SimulatedLayers).
pub struct SimulatedPubSubBridge {
    this: Weak<Mutex<SimulatedPubSubBridge>>,
    direction: PubSubDirection,
    pubsub: SharedPubSub,
    evm: SharedEventManager,
    port: Option<(u8, Arc<dyn PortSink>)>,
    flush_period: i64,
    timer: Option<EventId>,
    connected: bool,
    stats: BridgeStats,
}

impl SimulatedPubSubBridge {
    /// Create a bridge that forwards local updates every `flush_period`
    /// while connected.
    pub fn new_shared(
        pubsub: &SharedPubSub,
        evm: &SharedEventManager,
        direction: PubSubDirection,
        flush_period: i64,
    ) -> Arc<Mutex<Self>> {
        Arc::new_cyclic(|this| {
            Mutex::new(Self {
                this: this.clone(),
                direction,
                pubsub: pubsub.clone(),
                evm: evm.clone(),
                port: None,
                flush_period,
                timer: None,
                connected: false,
                stats: BridgeStats::default(),
            })
        })
    }

    /// Bridge counters.
    pub fn stats(&self) -> BridgeStats {
        self.stats
    }

    /// Forward pending local updates now.
    pub fn flush(&mut self) {
        if !self.connected {
            return;
        }
        let Some((port_id, sink)) = self.port.clone() else {
            return;
        };
        let updates = lock(&self.pubsub).take_updates();
        for (i, (topic, value)) in updates.iter().enumerate() {
            let sent = encode_update(topic, value)
                .and_then(|msg| sink.send(port_id, OP_UPDATE, &msg));
            match sent {
                Ok(()) => {
                    self.stats.tx_updates += 1;
                    trace!(topic, "update forwarded");
                }
                Err(e) => {
                    let mut pubsub = lock(&self.pubsub);
                    for (topic, _) in &updates[i..] {
                        pubsub.requeue(topic);
                    }
                    let deferred = (updates.len() - i) as u64;
                    self.stats.tx_deferred += deferred;
                    debug!(error = %e, deferred, "Update forwarding deferred");
                    break;
                }
            }
        }
    }

    fn send_snapshot(&mut self) -> StackResult<()> {
        let Some((port_id, sink)) = self.port.clone() else {
            return Ok(());
        };
        let snapshot = lock(&self.pubsub).snapshot("");
        debug!(topics = snapshot.len(), "Sending retained state");
        for (topic, value) in &snapshot {
            sink.send(port_id, OP_UPDATE, &encode_update(topic, value)?)?;
            self.stats.tx_updates += 1;
        }
        Ok(())
    }

    fn request_sync(&self) -> StackResult<()> {
        match &self.port {
            Some((port_id, sink)) => sink.send(*port_id, OP_SYNC_REQ, &[]),
            None => Ok(()),
        }
    }

    fn schedule_flush(&mut self) {
        let weak = self.this.clone();
        let at = self.evm.timestamp().saturating_add(self.flush_period);
        let id = self.evm.schedule(
            at,
            Box::new(move |_now| {
                if let Some(bridge) = weak.upgrade() {
                    let mut bridge = lock(&bridge);
                    bridge.timer = None;
                    if bridge.connected {
                        bridge.flush();
                        bridge.schedule_flush();
                    }
                }
            }),
        );
        self.timer = Some(id);
    }

    fn cancel_timer(&mut self) {
        if let Some(id) = self.timer.take() {
            self.evm.cancel(id);
        }
    }
}

impl PortHandler for SimulatedPubSubBridge {
    fn on_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Connected | LinkEvent::Reset => {
                self.connected = true;
                if self.direction == PubSubDirection::Upstream {
                    if let Err(e) = self.request_sync() {
                        warn!(error = %e, "Sync request failed");
                    }
                }
                self.cancel_timer();
                self.schedule_flush();
            }
            LinkEvent::Disconnected => {
                self.connected = false;
                self.cancel_timer();
            }
        }
    }

    fn on_recv(&mut self, _port_id: u8, port_data: u16, msg: &[u8]) {
        let result = match port_data {
            OP_UPDATE => decode_update(msg).map(|(topic, value)| {
                self.stats.rx_updates += 1;
                lock(&self.pubsub).publish_remote(topic, value);
            }),
            OP_SYNC_REQ if self.direction == PubSubDirection::Downstream => self.send_snapshot(),
            op => Err(StackError::Protocol(format!(
                "unexpected pubsub op {op} on {} bridge",
                self.direction
            ))),
        };
        if let Err(e) = result {
            self.stats.rx_errors += 1;
            warn!(op = port_data, error = %e, "Pubsub message not handled");
        }
    }
}

impl PubSubBridge for SimulatedPubSubBridge {
    fn direction(&self) -> PubSubDirection {
        self.direction
    }

    fn attach(&mut self, port_id: u8, sink: Arc<dyn PortSink>) {
        self.port = Some((port_id, sink));
    }
}

impl Drop for SimulatedPubSubBridge {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evm::Evm;
    use crate::layers::{EventManager, PUBSUB_PORT_ID};
    use crate::pubsub::PubSub;
    use serde_json::json;
    use tether_common::time::{ManualClock, TIME_MILLISECOND};

    #[derive(Default)]
    struct Sent {
        msgs: Mutex<Vec<(u16, Vec<u8>)>>,
        fail: Mutex<bool>,
    }

    impl PortSink for Sent {
        fn send(&self, _port_id: u8, port_data: u16, msg: &[u8]) -> StackResult<()> {
            if *self.fail.lock().unwrap() {
                return Err(StackError::BufferFull { capacity: 0 });
            }
            self.msgs.lock().unwrap().push((port_data, msg.to_vec()));
            Ok(())
        }
    }

    fn bridge(
        direction: PubSubDirection,
    ) -> (Arc<ManualClock>, Arc<Evm>, SharedPubSub, Arc<Sent>, Arc<Mutex<SimulatedPubSubBridge>>) {
        let clock = Arc::new(ManualClock::new(0));
        let evm = Arc::new(Evm::new(clock.clone()));
        let shared_evm: SharedEventManager = evm.clone();
        let pubsub: SharedPubSub = Arc::new(Mutex::new(PubSub::new()));
        let sent = Arc::new(Sent::default());
        let bridge =
            SimulatedPubSubBridge::new_shared(&pubsub, &shared_evm, direction, 10 * TIME_MILLISECOND);
        bridge.lock().unwrap().attach(PUBSUB_PORT_ID, sent.clone());
        (clock, evm, pubsub, sent, bridge)
    }

    #[test]
    fn test_update_codec() {
        let msg = encode_update("a/b", &json!({"x": [1, 2]})).unwrap();
        let (topic, value) = decode_update(&msg).unwrap();
        assert_eq!(topic, "a/b");
        assert_eq!(value, json!({"x": [1, 2]}));
        assert!(decode_update(b"no-terminator").is_err());
        assert!(decode_update(b"t\0{bad").is_err());
    }

    #[test]
    fn test_upstream_requests_sync_and_flushes() {
        let (clock, evm, pubsub, sent, bridge) = bridge(PubSubDirection::Upstream);
        pubsub.lock().unwrap().publish("t/v", 1);

        bridge.lock().unwrap().on_event(LinkEvent::Connected);
        assert_eq!(*sent.msgs.lock().unwrap(), vec![(OP_SYNC_REQ, vec![])]);

        clock.advance(10 * TIME_MILLISECOND);
        evm.process(evm.timestamp());
        let msgs = sent.msgs.lock().unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(decode_update(&msgs[1].1).unwrap(), ("t/v", json!(1)));
        drop(msgs);

        // Flush timer rearmed while connected
        assert_eq!(evm.pending(), 1);
        bridge.lock().unwrap().on_event(LinkEvent::Disconnected);
        assert_eq!(evm.pending(), 0);
    }

    #[test]
    fn test_failed_send_requeues() {
        let (_, _, pubsub, sent, bridge) = bridge(PubSubDirection::Upstream);
        bridge.lock().unwrap().on_event(LinkEvent::Connected);
        pubsub.lock().unwrap().publish("a", 1);
        pubsub.lock().unwrap().publish("b", 2);

        *sent.fail.lock().unwrap() = true;
        bridge.lock().unwrap().flush();
        assert_eq!(bridge.lock().unwrap().stats().tx_deferred, 2);
        assert!(pubsub.lock().unwrap().has_updates());

        *sent.fail.lock().unwrap() = false;
        bridge.lock().unwrap().flush();
        assert_eq!(bridge.lock().unwrap().stats().tx_updates, 2);
    }

    #[test]
    fn test_downstream_answers_sync_and_applies_updates() {
        let (_, _, pubsub, sent, bridge) = bridge(PubSubDirection::Downstream);
        pubsub.lock().unwrap().publish("d/1", "a");
        pubsub.lock().unwrap().publish("d/2", "b");
        bridge.lock().unwrap().on_event(LinkEvent::Connected);
        assert!(sent.msgs.lock().unwrap().is_empty());

        bridge
            .lock()
            .unwrap()
            .on_recv(PUBSUB_PORT_ID, OP_SYNC_REQ, &[]);
        assert_eq!(sent.msgs.lock().unwrap().len(), 2);

        let update = encode_update("u/1", &json!(true)).unwrap();
        bridge.lock().unwrap().on_recv(PUBSUB_PORT_ID, OP_UPDATE, &update);
        let mut store = pubsub.lock().unwrap();
        assert_eq!(store.query("u/1"), Some(&json!(true)));
        // Remote updates are not echoed
        assert!(store.take_updates().iter().all(|(t, _)| t != "u/1"));
    }

    #[test]
    fn test_unexpected_op_counted() {
        let (_, _, _, _, bridge) = bridge(PubSubDirection::Upstream);
        let mut bridge = bridge.lock().unwrap();
        bridge.on_recv(PUBSUB_PORT_ID, OP_SYNC_REQ, &[]);
        bridge.on_recv(PUBSUB_PORT_ID, 99, &[]);
        assert_eq!(bridge.stats().rx_errors, 2);
    }
}
