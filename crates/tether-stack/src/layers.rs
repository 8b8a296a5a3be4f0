//! Layer contracts consumed by the stack orchestrator.
//!
//! Each protocol layer is reached only through the traits in this module:
//!
//! ```text
//!        ┌──────────┐   ┌───────────────┐
//!        │  Port0   │   │ PubSubBridge  │     PortHandler (port 0 / port 1)
//!        └────┬─────┘   └──────┬────────┘
//!             │   PortSink     │
//!        ┌────┴────────────────┴────┐
//!        │        Transport         │           LinkUpper
//!        └────────────┬─────────────┘
//!                     │   FrameSink
//!        ┌────────────┴─────────────┐
//!        │         DataLink         │◄── LinkInput (receive path, may race process)
//!        └────────────┬─────────────┘
//!                     │   LowerLevel
//! ```
//!
//! Downward calls go through sink handles that only enqueue, so a handler
//! running inside [`DataLink::process`] may send without re-entering the
//! data-link layer.

use crate::pubsub::PubSub;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tether_common::config::{LinkConfig, Port0Mode, PubSubDirection};
use tether_common::error::StackResult;

/// Number of addressable transport ports.
pub const PORT_COUNT: u8 = 32;

/// Port carrying link negotiation and time synchronization.
pub const PORT0_ID: u8 = 0;

/// Port carrying pubsub synchronization.
pub const PUBSUB_PORT_ID: u8 = 1;

/// Metadata descriptor registered with port 0.
pub const PORT0_META: &str = r#"{"type":"oam","name":"port0","meta":"negotiation, status and time synchronization"}"#;

/// Metadata descriptor registered with the pubsub port.
pub const PUBSUB_META: &str = r#"{"type":"pubsub","name":"pubsub","meta":"topic bridge"}"#;

/// Mutex guarding the data-link layer against a concurrent receive path.
pub type LinkMutex = Arc<Mutex<()>>;

/// Event manager shared by the stack and its layers.
pub type SharedEventManager = Arc<dyn EventManager>;

/// Application pubsub store shared with the stack.
pub type SharedPubSub = Arc<Mutex<PubSub>>;

/// Upper layer registered with the data-link layer.
pub type SharedLinkUpper = Arc<Mutex<dyn LinkUpper>>;

/// Handler registered on a transport port.
pub type SharedPortHandler = Arc<Mutex<dyn PortHandler>>;

/// Transport layer owned by the stack.
pub type SharedTransport = Arc<Mutex<dyn Transport>>;

/// Port0 layer owned by the stack.
pub type SharedPort0 = Arc<Mutex<dyn Port0>>;

/// Pubsub bridge owned by the stack.
pub type SharedPubSubBridge = Arc<Mutex<dyn PubSubBridge>>;

/// Boxed timer callback, invoked with the processing timestamp.
pub type TimerCallback = Box<dyn FnOnce(i64) + Send>;

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Link state changes reported by the data-link layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkEvent {
    /// The peer requested a link reset.
    Reset,
    /// The link is established in both directions.
    Connected,
    /// The link was lost.
    Disconnected,
}

/// Data-link counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    /// Data frames transmitted (first transmission only).
    pub tx_frames: u64,
    /// Data frames retransmitted after an acknowledgement timeout.
    pub retransmissions: u64,
    /// Lower-level send failures.
    pub tx_errors: u64,
    /// Data frames delivered to the upper layer.
    pub rx_frames: u64,
    /// Received duplicate or out-of-order data frames.
    pub rx_duplicates: u64,
    /// Received frames dropped (malformed or receive window full).
    pub rx_dropped: u64,
    /// Completed link resets.
    pub resets: u64,
}

/// Snapshot of data-link state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkStatus {
    /// Whether the link is established.
    pub connected: bool,
    /// Link counters.
    pub stats: LinkStats,
}

/// Read access to data-link status from other layers.
pub trait LinkStatusSource: Send + Sync {
    /// Current link status.
    fn link_status(&self) -> LinkStatus;
}

/// Generic timer scheduling and timestamping.
///
/// Implementations are shared by reference between the stack and its
/// layers, so every method takes `&self`.
pub trait EventManager: Send + Sync {
    /// Current time.
    fn timestamp(&self) -> i64;

    /// Schedule `callback` to run at time `at`.
    fn schedule(&self, at: i64, callback: TimerCallback) -> EventId;

    /// Cancel a scheduled timer. Returns `false` if it already ran or never existed.
    fn cancel(&self, id: EventId) -> bool;

    /// Time from `now` until the next timer is due, or `TIME_MAX` if none.
    fn interval_next(&self, now: i64) -> i64;

    /// Run every timer due at or before `now`, returning how many ran.
    fn process(&self, now: i64) -> usize;
}

/// Identifier of a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub u64);

/// Receive path into the data-link layer.
///
/// May be invoked from a context other than the processing thread, such as
/// a UART interrupt handler or a reader thread.
pub trait LinkInput: Send + Sync {
    /// Deliver raw frame bytes received from the lower level.
    fn recv(&self, frame: &[u8]);
}

/// Lower-level byte transport underneath the data-link layer.
pub trait LowerLevel: Send {
    /// Bind (or unbind, with `None`) the data-link receive path.
    fn bind(&mut self, input: Option<Arc<dyn LinkInput>>);

    /// Transmit one frame.
    fn send(&mut self, frame: &[u8]) -> StackResult<()>;

    /// Bytes that can currently be sent without blocking.
    fn send_available(&self) -> usize;
}

/// Send path into the data-link layer.
pub trait FrameSink: Send + Sync {
    /// Queue a message for reliable delivery.
    fn send(&self, metadata: u32, msg: &[u8]) -> StackResult<()>;
}

/// Upper layer receiving data-link events and messages.
pub trait LinkUpper: Send {
    /// Handle a link state change.
    fn on_event(&mut self, event: LinkEvent);

    /// Handle a received message.
    fn on_recv(&mut self, metadata: u32, msg: &[u8]);
}

/// Reliable message link.
pub trait DataLink: Send {
    /// Register the layer that receives events and messages.
    fn register_upper_layer(&mut self, upper: SharedLinkUpper);

    /// Handle for queuing outbound messages.
    fn send_path(&self) -> Arc<dyn FrameSink>;

    /// Receive path bound to the lower level.
    fn input(&self) -> Arc<dyn LinkInput>;

    /// Handle for reading link status.
    fn status_source(&self) -> Arc<dyn LinkStatusSource>;

    /// Queue a message for reliable delivery.
    fn send(&self, metadata: u32, msg: &[u8]) -> StackResult<()> {
        self.send_path().send(metadata, msg)
    }

    /// Time until [`process`](Self::process) must run again, or `TIME_MAX`.
    fn service_interval(&self) -> i64;

    /// Retransmit, flush queued messages and deliver received messages.
    fn process(&mut self);

    /// Set or clear the mutex guarding the receive path.
    fn register_mutex(&mut self, mutex: Option<LinkMutex>);
}

/// Send path for transport ports.
pub trait PortSink: Send + Sync {
    /// Send a message on `port_id` with 16 bits of port-specific data.
    fn send(&self, port_id: u8, port_data: u16, msg: &[u8]) -> StackResult<()>;
}

/// Handler for a transport port.
pub trait PortHandler: Send {
    /// Handle a link state change.
    fn on_event(&mut self, event: LinkEvent);

    /// Handle a message received on `port_id`.
    fn on_recv(&mut self, port_id: u8, port_data: u16, msg: &[u8]);
}

/// Port multiplexer over the data-link layer.
pub trait Transport: LinkUpper {
    /// Register `handler` on `port_id` with a JSON metadata descriptor.
    fn register_port(
        &mut self,
        port_id: u8,
        meta: &str,
        handler: SharedPortHandler,
    ) -> StackResult<()>;

    /// Metadata registered on `port_id`.
    fn port_meta(&self, port_id: u8) -> Option<&str>;

    /// Handle for sending on any port.
    fn send_path(&self) -> Arc<dyn PortSink>;
}

/// Link negotiation layer on port 0.
pub trait Port0: PortHandler {
    /// Role of this end of the link.
    fn mode(&self) -> Port0Mode;
}

/// Pubsub synchronization layer.
pub trait PubSubBridge: PortHandler {
    /// Bridge direction.
    fn direction(&self) -> PubSubDirection;

    /// Attach the send path for the port this bridge is registered on.
    fn attach(&mut self, port_id: u8, sink: Arc<dyn PortSink>);
}

/// Inputs for constructing the port0 layer.
pub struct Port0Context<'a> {
    /// Role of this end of the link.
    pub mode: Port0Mode,
    /// Data-link status.
    pub link: Arc<dyn LinkStatusSource>,
    /// Shared event manager.
    pub evm: &'a SharedEventManager,
    /// Transport send path.
    pub transport: Arc<dyn PortSink>,
    /// Shared pubsub store.
    pub pubsub: &'a SharedPubSub,
    /// Prefix for topics published by port0.
    pub topic_prefix: &'a str,
}

/// Constructs the layers composed by [`Stack`](crate::stack::Stack).
///
/// Layers that other layers call back into are returned behind
/// `Arc<Mutex<_>>` so the factory can hand them a weak self reference.
pub trait LayerFactory {
    /// Data-link implementation.
    type DataLink: DataLink + 'static;
    /// Transport implementation.
    type Transport: Transport + 'static;
    /// Port0 implementation.
    type Port0: Port0 + 'static;
    /// Pubsub bridge implementation.
    type PubSubBridge: PubSubBridge + 'static;

    /// Construct the data-link layer over a lower-level binding.
    fn data_link(
        &mut self,
        config: &LinkConfig,
        evm: &SharedEventManager,
        lower: Box<dyn LowerLevel>,
    ) -> StackResult<Box<Self::DataLink>>;

    /// Construct the transport layer over the data-link send path.
    fn transport(&mut self, link: Arc<dyn FrameSink>) -> StackResult<Arc<Mutex<Self::Transport>>>;

    /// Construct the port0 layer.
    fn port0(&mut self, ctx: Port0Context<'_>) -> StackResult<Arc<Mutex<Self::Port0>>>;

    /// Construct the pubsub bridge for `direction`.
    fn pubsub_bridge(
        &mut self,
        pubsub: &SharedPubSub,
        evm: &SharedEventManager,
        direction: PubSubDirection,
    ) -> StackResult<Arc<Mutex<Self::PubSubBridge>>>;
}
