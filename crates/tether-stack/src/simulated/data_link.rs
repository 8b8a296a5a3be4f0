//! Simulated reliable data-link layer.
//!
//! Frame layout (little endian):
//!
//! | kind | body |
//! |------|------|
//! | `0x01` data  | seq `u16`, metadata `u32`, length `u16`, payload |
//! | `0x02` ack   | next expected seq `u16` (cumulative) |
//! | `0x03` reset | `0` request, `1` response |
//!
//! A reset request restarts both directions on the receiving side; the
//! matching response completes the handshake on the sender. Lost frames are
//! recovered go-back-N: after `tx_timeout` without acknowledgement every
//! in-flight frame is sent again.

use crate::layers::{
    lock, DataLink, FrameSink, LinkEvent, LinkInput, LinkMutex, LinkStats, LinkStatus,
    LinkStatusSource, LowerLevel, SharedEventManager, SharedLinkUpper,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tether_common::config::{LinkConfig, MAX_PAYLOAD_LIMIT};
use tether_common::error::{Layer, StackError, StackResult};
use tether_common::ring_buffer::RingBufferU64;
use tether_common::time::{duration_to_time, TIME_MAX};
use tracing::{debug, info, trace, warn};

const KIND_DATA: u8 = 0x01;
const KIND_ACK: u8 = 0x02;
const KIND_RESET: u8 = 0x03;

const DATA_HEADER_LEN: usize = 9;

/// Consecutive retransmission rounds without progress before the link is
/// declared lost.
pub const MAX_RETRANSMIT_ROUNDS: u32 = 8;

#[derive(Debug, PartialEq, Eq)]
enum Frame<'a> {
    Data {
        seq: u16,
        metadata: u32,
        payload: &'a [u8],
    },
    Ack {
        next: u16,
    },
    Reset {
        response: bool,
    },
}

impl<'a> Frame<'a> {
    fn decode(bytes: &'a [u8]) -> Option<Self> {
        let (&kind, body) = bytes.split_first()?;
        match kind {
            KIND_DATA => {
                if body.len() < DATA_HEADER_LEN - 1 {
                    return None;
                }
                let seq = u16::from_le_bytes([body[0], body[1]]);
                let metadata = u32::from_le_bytes([body[2], body[3], body[4], body[5]]);
                let len = usize::from(u16::from_le_bytes([body[6], body[7]]));
                let payload = body.get(8..)?;
                (payload.len() == len).then_some(Frame::Data {
                    seq,
                    metadata,
                    payload,
                })
            }
            KIND_ACK if body.len() == 2 => Some(Frame::Ack {
                next: u16::from_le_bytes([body[0], body[1]]),
            }),
            KIND_RESET if body.len() == 1 => Some(Frame::Reset {
                response: body[0] != 0,
            }),
            _ => None,
        }
    }

    fn encode(&self) -> Vec<u8> {
        match *self {
            Frame::Data {
                seq,
                metadata,
                payload,
            } => {
                let mut out = Vec::with_capacity(DATA_HEADER_LEN + payload.len());
                out.push(KIND_DATA);
                out.extend_from_slice(&seq.to_le_bytes());
                out.extend_from_slice(&metadata.to_le_bytes());
                // max_payload is at most MAX_PAYLOAD_LIMIT, well inside u16.
                out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
                out.extend_from_slice(payload);
                out
            }
            Frame::Ack { next } => {
                let [lo, hi] = next.to_le_bytes();
                vec![KIND_ACK, lo, hi]
            }
            Frame::Reset { response } => vec![KIND_RESET, u8::from(response)],
        }
    }
}

/// State shared between the link, its send path and its receive path.
struct LinkShared {
    mutex: Mutex<Option<LinkMutex>>,
    inbound: Mutex<VecDeque<Vec<u8>>>,
    outbound: Mutex<VecDeque<(u32, Vec<u8>)>>,
    status: Mutex<LinkStatus>,
    outbound_capacity: usize,
    max_payload: usize,
    rx_window: usize,
}

impl LinkShared {
    fn mutex_token(&self) -> Option<LinkMutex> {
        lock(&self.mutex).clone()
    }

    fn update_stats(&self, f: impl FnOnce(&mut LinkStats)) {
        f(&mut lock(&self.status).stats);
    }

    fn set_connected(&self, connected: bool) {
        lock(&self.status).connected = connected;
    }
}

impl FrameSink for LinkShared {
    fn send(&self, metadata: u32, msg: &[u8]) -> StackResult<()> {
        if msg.len() > self.max_payload {
            return Err(StackError::MessageTooLarge {
                size: msg.len(),
                max: self.max_payload,
            });
        }
        if !lock(&self.status).connected {
            return Err(StackError::NotConnected);
        }
        let mut outbound = lock(&self.outbound);
        if outbound.len() >= self.outbound_capacity {
            return Err(StackError::BufferFull {
                capacity: self.outbound_capacity,
            });
        }
        outbound.push_back((metadata, msg.to_vec()));
        Ok(())
    }
}

impl LinkInput for LinkShared {
    fn recv(&self, frame: &[u8]) {
        let token = self.mutex_token();
        let _guard = token.as_deref().map(lock);
        let mut inbound = lock(&self.inbound);
        if frame.first() == Some(&KIND_DATA) {
            let queued = inbound
                .iter()
                .filter(|f| f.first() == Some(&KIND_DATA))
                .count();
            if queued >= self.rx_window {
                drop(inbound);
                self.update_stats(|s| s.rx_dropped += 1);
                trace!(queued, "receive window full, frame dropped");
                return;
            }
        }
        inbound.push_back(frame.to_vec());
    }
}

impl LinkStatusSource for LinkShared {
    fn link_status(&self) -> LinkStatus {
        *lock(&self.status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Resetting { next_attempt: i64 },
    Connected,
}

enum Delivery {
    Event(LinkEvent),
    Message(u32, Vec<u8>),
}

/// Data-link layer over a [`LowerLevel`].
pub struct SimulatedDataLink {
    evm: SharedEventManager,
    lower: Box<dyn LowerLevel>,
    shared: Arc<LinkShared>,
    upper: Option<SharedLinkUpper>,
    /// Transmit counters of unacknowledged frames, oldest first.
    in_flight: RingBufferU64<Box<[u64]>>,
    frames: Vec<Vec<u8>>,
    tx_window: usize,
    tx_timeout: i64,
    tx_count: u64,
    rx_next: u16,
    retransmit_at: Option<i64>,
    retransmit_rounds: u32,
    state: LinkState,
}

impl SimulatedDataLink {
    /// Create a link and bind its receive path to `lower`.
    pub fn new(
        config: &LinkConfig,
        evm: SharedEventManager,
        mut lower: Box<dyn LowerLevel>,
    ) -> StackResult<Self> {
        let frame_count = config.tx_frame_count as usize;
        let tx_window = config.tx_window_size as usize;
        let invalid = |reason: String| StackError::LayerInit {
            layer: Layer::DataLink,
            reason,
        };
        if tx_window == 0 || tx_window >= frame_count {
            return Err(invalid(format!(
                "tx_window_size {tx_window} must be in 1..{frame_count}"
            )));
        }
        if config.rx_window_size == 0 {
            return Err(invalid("rx_window_size must be nonzero".into()));
        }
        if config.max_payload == 0 || config.max_payload > MAX_PAYLOAD_LIMIT {
            return Err(invalid(format!(
                "max_payload {} must be in 1..={MAX_PAYLOAD_LIMIT}",
                config.max_payload
            )));
        }
        if config.tx_timeout.is_zero() {
            return Err(invalid("tx_timeout must be nonzero".into()));
        }
        let shared = Arc::new(LinkShared {
            mutex: Mutex::new(None),
            inbound: Mutex::new(VecDeque::new()),
            outbound: Mutex::new(VecDeque::new()),
            status: Mutex::new(LinkStatus::default()),
            outbound_capacity: frame_count,
            max_payload: config.max_payload,
            rx_window: config.rx_window_size as usize,
        });
        lower.bind(Some(shared.clone()));

        let now = evm.timestamp();
        debug!(frame_count, tx_window, "Data link created");
        Ok(Self {
            evm,
            lower,
            shared,
            upper: None,
            in_flight: RingBufferU64::new(vec![0u64; frame_count].into_boxed_slice()),
            frames: vec![Vec::new(); frame_count],
            tx_window,
            tx_timeout: duration_to_time(config.tx_timeout),
            tx_count: 0,
            rx_next: 0,
            retransmit_at: None,
            retransmit_rounds: 0,
            state: LinkState::Resetting { next_attempt: now },
        })
    }

    /// Whether the reset handshake has completed.
    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    /// Number of unacknowledged frames.
    pub fn in_flight(&self) -> usize {
        self.in_flight.size()
    }

    fn transmit_raw(&mut self, frame: &[u8]) {
        if let Err(e) = self.lower.send(frame) {
            self.shared.update_stats(|s| s.tx_errors += 1);
            warn!(error = %e, "Lower level send failed");
        }
    }

    fn restart(&mut self) {
        self.tx_count = 0;
        self.rx_next = 0;
        self.in_flight.clear();
        self.retransmit_at = None;
        self.retransmit_rounds = 0;
        self.shared.update_stats(|s| s.resets += 1);
    }

    fn drain_inbound(&self) -> VecDeque<Vec<u8>> {
        let token = self.shared.mutex_token();
        let _guard = token.as_deref().map(lock);
        std::mem::take(&mut *lock(&self.shared.inbound))
    }

    fn handle_frame(&mut self, bytes: &[u8], now: i64, out: &mut Vec<Delivery>) -> bool {
        let Some(frame) = Frame::decode(bytes) else {
            self.shared.update_stats(|s| s.rx_dropped += 1);
            warn!(len = bytes.len(), "Malformed frame dropped");
            return false;
        };
        match frame {
            Frame::Reset { response: false } => {
                self.restart();
                self.transmit_raw(&Frame::Reset { response: true }.encode());
                if self.is_connected() {
                    info!("Link reset by peer");
                    out.push(Delivery::Event(LinkEvent::Reset));
                } else {
                    self.connect(out);
                }
                false
            }
            Frame::Reset { response: true } => {
                if !self.is_connected() {
                    self.restart();
                    self.connect(out);
                }
                false
            }
            Frame::Data { .. } if !self.is_connected() => {
                self.shared.update_stats(|s| s.rx_dropped += 1);
                false
            }
            Frame::Data {
                seq,
                metadata,
                payload,
            } => {
                if seq == self.rx_next {
                    self.rx_next = self.rx_next.wrapping_add(1);
                    self.shared.update_stats(|s| s.rx_frames += 1);
                    trace!(seq, metadata, len = payload.len(), "frame received");
                    out.push(Delivery::Message(metadata, payload.to_vec()));
                } else {
                    self.shared.update_stats(|s| s.rx_duplicates += 1);
                    trace!(seq, expected = self.rx_next, "out-of-order frame ignored");
                }
                true
            }
            Frame::Ack { next } => {
                self.handle_ack(next, now);
                false
            }
        }
    }

    fn handle_ack(&mut self, next: u16, now: i64) {
        let Some(oldest) = self.in_flight.peek() else {
            return;
        };
        // Wire sequence numbers are the low 16 bits of the transmit counter.
        let acked = usize::from(next.wrapping_sub(oldest as u16));
        if acked == 0 || acked > self.in_flight.size() {
            return;
        }
        let _ = self.in_flight.discard(acked);
        self.retransmit_rounds = 0;
        self.retransmit_at = if self.in_flight.is_empty() {
            None
        } else {
            Some(now.saturating_add(self.tx_timeout))
        };
        trace!(next, acked, "frames acknowledged");
    }

    fn connect(&mut self, out: &mut Vec<Delivery>) {
        self.state = LinkState::Connected;
        self.shared.set_connected(true);
        info!("Link connected");
        out.push(Delivery::Event(LinkEvent::Connected));
    }

    fn disconnect(&mut self, now: i64, out: &mut Vec<Delivery>) {
        self.state = LinkState::Resetting { next_attempt: now };
        self.shared.set_connected(false);
        self.in_flight.clear();
        self.retransmit_at = None;
        self.retransmit_rounds = 0;
        lock(&self.shared.outbound).clear();
        warn!("Link lost");
        out.push(Delivery::Event(LinkEvent::Disconnected));
    }

    fn retransmit(&mut self, now: i64, out: &mut Vec<Delivery>) {
        let Some(at) = self.retransmit_at else {
            return;
        };
        if now < at {
            return;
        }
        self.retransmit_rounds += 1;
        if self.retransmit_rounds > MAX_RETRANSMIT_ROUNDS {
            self.disconnect(now, out);
            return;
        }

        let frame_count = self.frames.len() as u64;
        let mut resent = 0u64;
        for tx in self.in_flight.iter() {
            let frame = &self.frames[(tx % frame_count) as usize];
            if let Err(e) = self.lower.send(frame) {
                warn!(error = %e, "Lower level send failed");
            }
            resent += 1;
        }
        self.shared.update_stats(|s| s.retransmissions += resent);
        self.retransmit_at = Some(now.saturating_add(self.tx_timeout));
        debug!(resent, round = self.retransmit_rounds, "Retransmitted in-flight frames");
    }

    fn transmit(&mut self, now: i64) {
        let frame_count = self.frames.len() as u64;
        while self.in_flight.size() < self.tx_window {
            let Some((metadata, payload)) = lock(&self.shared.outbound).pop_front() else {
                break;
            };
            let tx = self.tx_count;
            let frame = Frame::Data {
                seq: tx as u16,
                metadata,
                payload: &payload,
            }
            .encode();
            let pushed = self.in_flight.push(tx);
            debug_assert!(pushed, "transmit window exceeds in-flight capacity");
            self.tx_count = tx.wrapping_add(1);
            self.transmit_raw(&frame);
            self.frames[(tx % frame_count) as usize] = frame;
            self.shared.update_stats(|s| s.tx_frames += 1);
            if self.retransmit_at.is_none() {
                self.retransmit_at = Some(now.saturating_add(self.tx_timeout));
            }
        }
    }
}

impl DataLink for SimulatedDataLink {
    fn register_upper_layer(&mut self, upper: SharedLinkUpper) {
        self.upper = Some(upper);
    }

    fn send_path(&self) -> Arc<dyn FrameSink> {
        self.shared.clone()
    }

    fn input(&self) -> Arc<dyn LinkInput> {
        self.shared.clone()
    }

    fn status_source(&self) -> Arc<dyn LinkStatusSource> {
        self.shared.clone()
    }

    fn service_interval(&self) -> i64 {
        if !lock(&self.shared.inbound).is_empty() {
            return 0;
        }
        let now = self.evm.timestamp();
        match self.state {
            LinkState::Resetting { next_attempt } => next_attempt.saturating_sub(now).max(0),
            LinkState::Connected => {
                if self.in_flight.size() < self.tx_window
                    && !lock(&self.shared.outbound).is_empty()
                {
                    return 0;
                }
                self.retransmit_at
                    .map_or(TIME_MAX, |at| at.saturating_sub(now).max(0))
            }
        }
    }

    fn process(&mut self) {
        let now = self.evm.timestamp();
        let mut deliveries = Vec::new();

        let mut ack_pending = false;
        for frame in self.drain_inbound() {
            ack_pending |= self.handle_frame(&frame, now, &mut deliveries);
        }
        if ack_pending {
            self.transmit_raw(&Frame::Ack { next: self.rx_next }.encode());
        }

        if let Some(upper) = self.upper.as_ref() {
            for delivery in deliveries.drain(..) {
                let mut upper = lock(upper);
                match delivery {
                    Delivery::Event(event) => upper.on_event(event),
                    Delivery::Message(metadata, msg) => upper.on_recv(metadata, &msg),
                }
            }
        }

        match self.state {
            LinkState::Resetting { next_attempt } if now >= next_attempt => {
                trace!("sending reset request");
                self.transmit_raw(&Frame::Reset { response: false }.encode());
                self.state = LinkState::Resetting {
                    next_attempt: now.saturating_add(self.tx_timeout),
                };
            }
            LinkState::Resetting { .. } => {}
            LinkState::Connected => {
                self.retransmit(now, &mut deliveries);
                if self.is_connected() {
                    self.transmit(now);
                }
            }
        }

        // Link loss detected while retransmitting.
        if let Some(upper) = self.upper.as_ref() {
            for delivery in deliveries {
                if let Delivery::Event(event) = delivery {
                    lock(upper).on_event(event);
                }
            }
        }
    }

    fn register_mutex(&mut self, mutex: Option<LinkMutex>) {
        *lock(&self.shared.mutex) = mutex;
    }
}

impl Drop for SimulatedDataLink {
    fn drop(&mut self) {
        self.lower.bind(None);
        self.shared.set_connected(false);
    }
}
