//! Simulated port0: link state, status and time synchronization.
//!
//! Port data selects the operation:
//!
//! | op | payload |
//! |----|---------|
//! | `TIMESYNC_REQ` | counter at send `u64` |
//! | `TIMESYNC_RSP` | counter at send `u64`, time lower `i64`, time upper `i64` |
//! | `STATUS_REQ`   | empty |
//! | `STATUS_RSP`   | JSON link status |

use crate::layers::{
    lock, EventId, LinkEvent, LinkStatusSource, Port0, Port0Context, PortHandler, PortSink,
    SharedEventManager, SharedPubSub, PORT0_ID,
};
use crate::timesync::SharedTimeSync;
use serde::Serialize;
use std::sync::{Arc, Mutex, Weak};
use tether_common::config::Port0Mode;
use tether_common::error::{StackError, StackResult};
use tether_common::time::CounterSource;
use tracing::{debug, info, trace, warn};

/// Time synchronization request.
pub const OP_TIMESYNC_REQ: u16 = 1;
/// Time synchronization response.
pub const OP_TIMESYNC_RSP: u16 = 2;
/// Link status request.
pub const OP_STATUS_REQ: u16 = 3;
/// Link status response.
pub const OP_STATUS_RSP: u16 = 4;

const TIMESYNC_RSP_LEN: usize = 24;

/// Port0 counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Port0Stats {
    /// Time sync requests sent (client) or answered (server).
    pub timesync_requests: u64,
    /// Time sync responses applied.
    pub timesync_responses: u64,
    /// Time sync responses that were malformed or rejected.
    pub timesync_errors: u64,
    /// Status requests answered.
    pub status_requests: u64,
}

/// Port0 layer for [`SimulatedLayers`](super::SimulatedLayers).
pub struct SimulatedPort0 {
    this: Weak<Mutex<SimulatedPort0>>,
    mode: Port0Mode,
    state_topic: String,
    peer_status_topic: String,
    evm: SharedEventManager,
    sink: Arc<dyn PortSink>,
    pubsub: SharedPubSub,
    link: Arc<dyn LinkStatusSource>,
    counter: Arc<dyn CounterSource>,
    timesync: Option<SharedTimeSync>,
    period: i64,
    timer: Option<EventId>,
    connected: bool,
    stats: Port0Stats,
}

impl SimulatedPort0 {
    /// Create the layer. Client mode requests time synchronization every
    /// `period` while connected, feeding responses into `timesync`.
    pub fn new_shared(
        ctx: Port0Context<'_>,
        counter: Arc<dyn CounterSource>,
        timesync: Option<SharedTimeSync>,
        period: i64,
    ) -> Arc<Mutex<Self>> {
        Arc::new_cyclic(|this| {
            Mutex::new(Self {
                this: this.clone(),
                mode: ctx.mode,
                state_topic: format!("{}0/state", ctx.topic_prefix),
                peer_status_topic: format!("{}0/peer_status", ctx.topic_prefix),
                evm: ctx.evm.clone(),
                sink: ctx.transport,
                pubsub: ctx.pubsub.clone(),
                link: ctx.link,
                counter,
                timesync,
                period,
                timer: None,
                connected: false,
                stats: Port0Stats::default(),
            })
        })
    }

    /// Whether the link is connected.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Port0 counters.
    pub fn stats(&self) -> Port0Stats {
        self.stats
    }

    /// Send a time synchronization request.
    pub fn request_timesync(&mut self) -> StackResult<()> {
        let counter = self.counter.counter().value;
        self.sink
            .send(PORT0_ID, OP_TIMESYNC_REQ, &counter.to_le_bytes())?;
        self.stats.timesync_requests += 1;
        trace!(counter, "time sync request sent");
        Ok(())
    }

    /// Ask the peer for its link status, published under `0/peer_status`.
    pub fn request_status(&self) -> StackResult<()> {
        self.sink.send(PORT0_ID, OP_STATUS_REQ, &[])
    }

    fn publish_state(&self, state: &str) {
        lock(&self.pubsub).publish(&self.state_topic, state);
    }

    fn schedule_timesync(&mut self) {
        let weak = self.this.clone();
        let at = self.evm.timestamp().saturating_add(self.period);
        let id = self.evm.schedule(
            at,
            Box::new(move |_now| {
                if let Some(port0) = weak.upgrade() {
                    lock(&port0).on_timesync_timer();
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

    fn on_timesync_timer(&mut self) {
        self.timer = None;
        if !self.connected {
            return;
        }
        if let Err(e) = self.request_timesync() {
            warn!(error = %e, "Time sync request failed");
        }
        self.schedule_timesync();
    }

    fn handle_timesync_request(&mut self, msg: &[u8]) -> StackResult<()> {
        let counter_at_send: [u8; 8] = msg
            .try_into()
            .map_err(|_| StackError::Protocol(format!("timesync request length {}", msg.len())))?;
        let now = self.evm.timestamp();
        let mut rsp = [0u8; TIMESYNC_RSP_LEN];
        rsp[..8].copy_from_slice(&counter_at_send);
        rsp[8..16].copy_from_slice(&now.to_le_bytes());
        rsp[16..].copy_from_slice(&now.to_le_bytes());
        self.sink.send(PORT0_ID, OP_TIMESYNC_RSP, &rsp)?;
        self.stats.timesync_requests += 1;
        Ok(())
    }

    fn handle_timesync_response(&mut self, msg: &[u8]) -> StackResult<()> {
        let counter_at_receive = self.counter.counter().value;
        if msg.len() != TIMESYNC_RSP_LEN {
            return Err(StackError::Protocol(format!(
                "timesync response length {}",
                msg.len()
            )));
        }
        let field = |i: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&msg[i * 8..(i + 1) * 8]);
            b
        };
        let counter_at_send = u64::from_le_bytes(field(0));
        let time_lower = i64::from_le_bytes(field(1));
        let time_upper = i64::from_le_bytes(field(2));

        let Some(timesync) = self.timesync.as_ref() else {
            debug!("Time sync response ignored: no engine");
            return Ok(());
        };
        lock(timesync).update(counter_at_send, time_lower, time_upper, counter_at_receive)?;
        self.stats.timesync_responses += 1;
        Ok(())
    }

    fn handle_status_request(&mut self) -> StackResult<()> {
        let status = serde_json::to_vec(&self.link.link_status())
            .map_err(|e| StackError::Protocol(e.to_string()))?;
        self.sink.send(PORT0_ID, OP_STATUS_RSP, &status)?;
        self.stats.status_requests += 1;
        Ok(())
    }

    fn handle_status_response(&self, msg: &[u8]) -> StackResult<()> {
        let status: serde_json::Value =
            serde_json::from_slice(msg).map_err(|e| StackError::Protocol(e.to_string()))?;
        lock(&self.pubsub).publish(&self.peer_status_topic, status);
        Ok(())
    }
}

impl PortHandler for SimulatedPort0 {
    fn on_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Connected | LinkEvent::Reset => {
                self.connected = true;
                self.publish_state("connected");
                info!(mode = %self.mode, ?event, "Port0 link up");
                if self.mode == Port0Mode::Client {
                    self.cancel_timer();
                    if let Err(e) = self.request_timesync() {
                        warn!(error = %e, "Time sync request failed");
                    }
                    self.schedule_timesync();
                }
            }
            LinkEvent::Disconnected => {
                self.connected = false;
                self.cancel_timer();
                self.publish_state("disconnected");
                info!(mode = %self.mode, "Port0 link down");
            }
        }
    }

    fn on_recv(&mut self, _port_id: u8, port_data: u16, msg: &[u8]) {
        let result = match (port_data, self.mode) {
            (OP_TIMESYNC_REQ, Port0Mode::Server) => self.handle_timesync_request(msg),
            (OP_TIMESYNC_RSP, Port0Mode::Client) => {
                let result = self.handle_timesync_response(msg);
                if result.is_err() {
                    self.stats.timesync_errors += 1;
                }
                result
            }
            (OP_STATUS_REQ, _) => self.handle_status_request(),
            (OP_STATUS_RSP, _) => self.handle_status_response(msg),
            (op, mode) => Err(StackError::Protocol(format!(
                "unexpected port0 op {op} in {mode} mode"
            ))),
        };
        if let Err(e) = result {
            warn!(op = port_data, error = %e, "Port0 message not handled");
        }
    }
}

impl Port0 for SimulatedPort0 {
    fn mode(&self) -> Port0Mode {
        self.mode
    }
}

impl Drop for SimulatedPort0 {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evm::Evm;
    use crate::layers::{EventManager, LinkStatus, SharedEventManager};
    use crate::pubsub::PubSub;
    use crate::timesync::TimeSync;
    use serde_json::json;
    use tether_common::time::{ManualClock, ManualCounter, TIME_HOUR, TIME_SECOND};

    #[derive(Default)]
    struct Sent(Mutex<Vec<(u16, Vec<u8>)>>);

    impl PortSink for Sent {
        fn send(&self, _port_id: u8, port_data: u16, msg: &[u8]) -> StackResult<()> {
            self.0.lock().unwrap().push((port_data, msg.to_vec()));
            Ok(())
        }
    }

    struct Up;

    impl LinkStatusSource for Up {
        fn link_status(&self) -> LinkStatus {
            LinkStatus {
                connected: true,
                ..LinkStatus::default()
            }
        }
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        counter: Arc<ManualCounter>,
        evm: Arc<Evm>,
        sent: Arc<Sent>,
        pubsub: SharedPubSub,
        port0: Arc<Mutex<SimulatedPort0>>,
        timesync: SharedTimeSync,
    }

    fn fixture(mode: Port0Mode) -> Fixture {
        let clock = Arc::new(ManualClock::new(TIME_HOUR));
        let counter = Arc::new(ManualCounter::new(1000));
        let evm = Arc::new(Evm::new(clock.clone()));
        let shared_evm: SharedEventManager = evm.clone();
        let sent = Arc::new(Sent::default());
        let pubsub: SharedPubSub = Arc::new(Mutex::new(PubSub::new()));
        let timesync = TimeSync::shared(counter.clone());
        let port0 = SimulatedPort0::new_shared(
            Port0Context {
                mode,
                link: Arc::new(Up),
                evm: &shared_evm,
                transport: sent.clone(),
                pubsub: &pubsub,
                topic_prefix: "t/",
            },
            counter.clone(),
            Some(timesync.clone()),
            TIME_SECOND,
        );
        Fixture {
            clock,
            counter,
            evm,
            sent,
            pubsub,
            port0,
            timesync,
        }
    }

    #[test]
    fn test_client_requests_periodically() {
        let f = fixture(Port0Mode::Client);
        f.counter.set_value(500);
        f.port0.lock().unwrap().on_event(LinkEvent::Connected);
        assert_eq!(
            f.pubsub.lock().unwrap().query("t/0/state"),
            Some(&json!("connected"))
        );
        assert_eq!(
            *f.sent.0.lock().unwrap(),
            vec![(OP_TIMESYNC_REQ, 500u64.to_le_bytes().to_vec())]
        );

        f.clock.advance(TIME_SECOND);
        assert_eq!(f.evm.process(f.evm.timestamp()), 1);
        assert_eq!(f.sent.0.lock().unwrap().len(), 2);
        assert_eq!(f.evm.pending(), 1);

        f.port0.lock().unwrap().on_event(LinkEvent::Disconnected);
        assert_eq!(f.evm.pending(), 0);
        assert_eq!(
            f.pubsub.lock().unwrap().query("t/0/state"),
            Some(&json!("disconnected"))
        );
    }

    #[test]
    fn test_client_applies_response() {
        let f = fixture(Port0Mode::Client);
        f.counter.set_value(60_010);
        let mut rsp = Vec::new();
        rsp.extend_from_slice(&59_990u64.to_le_bytes());
        rsp.extend_from_slice(&TIME_HOUR.to_le_bytes());
        rsp.extend_from_slice(&TIME_HOUR.to_le_bytes());
        f.port0.lock().unwrap().on_recv(PORT0_ID, OP_TIMESYNC_RSP, &rsp);

        let ts = f.timesync.lock().unwrap();
        assert!(ts.is_calibrated());
        assert_eq!(ts.time_at(60_000), TIME_HOUR);
        assert_eq!(f.port0.lock().unwrap().stats().timesync_responses, 1);
    }

    #[test]
    fn test_client_counts_malformed_response() {
        let f = fixture(Port0Mode::Client);
        f.port0.lock().unwrap().on_recv(PORT0_ID, OP_TIMESYNC_RSP, &[1, 2, 3]);
        assert_eq!(f.port0.lock().unwrap().stats().timesync_errors, 1);
        assert!(!f.timesync.lock().unwrap().is_calibrated());
    }

    #[test]
    fn test_server_answers_with_its_time() {
        let f = fixture(Port0Mode::Server);
        f.port0
            .lock()
            .unwrap()
            .on_recv(PORT0_ID, OP_TIMESYNC_REQ, &42u64.to_le_bytes());
        let sent = f.sent.0.lock().unwrap();
        let (op, rsp) = &sent[0];
        assert_eq!(*op, OP_TIMESYNC_RSP);
        assert_eq!(rsp[..8], 42u64.to_le_bytes());
        assert_eq!(rsp[8..16], TIME_HOUR.to_le_bytes());
        assert_eq!(rsp[16..], TIME_HOUR.to_le_bytes());
    }

    #[test]
    fn test_status_exchange() {
        let f = fixture(Port0Mode::Server);
        f.port0.lock().unwrap().on_recv(PORT0_ID, OP_STATUS_REQ, &[]);
        let (op, status) = f.sent.0.lock().unwrap()[0].clone();
        assert_eq!(op, OP_STATUS_RSP);

        f.port0.lock().unwrap().on_recv(PORT0_ID, OP_STATUS_RSP, &status);
        let pubsub = f.pubsub.lock().unwrap();
        let published = pubsub.query("t/0/peer_status").unwrap();
        assert_eq!(published["connected"], json!(true));
    }
}
