//! Stack orchestrator.
//!
//! Composes the data-link, transport, port0 and pubsub bridge layers into a
//! single aggregate with an all-or-nothing lifecycle, and drives it from one
//! cooperative processing thread:
//!
//! ```ignore
//! let mut stack = Stack::initialize(&mut factory, &config.link, mode, "t/", evm, lower, pubsub)?;
//! loop {
//!     let wait = stack.interval_next();
//!     // sleep up to `wait`, or until the lower level signals receive data
//!     stack.process();
//! }
//! ```

use crate::layers::{
    lock, DataLink, LayerFactory, LinkMutex, LinkStatus, LowerLevel, Port0Context, PubSubBridge,
    SharedEventManager, SharedLinkUpper, SharedPort0, SharedPortHandler, SharedPubSub,
    SharedPubSubBridge, SharedTransport, Transport, PORT0_ID, PORT0_META, PUBSUB_META,
    PUBSUB_PORT_ID,
};
use std::fmt;
use tether_common::config::{LinkConfig, Port0Mode};
use tether_common::error::{Layer, StackError, StackResult};
use tether_common::time::TIME_MAX;
use tracing::{debug, error, info};

/// Communication stack aggregate.
///
/// Either every layer is present or the stack is finalized. Dropping the
/// stack finalizes it.
pub struct Stack {
    mode: Port0Mode,
    evm: SharedEventManager,
    pubsub: SharedPubSub,
    dl: Option<Box<dyn DataLink>>,
    transport: Option<SharedTransport>,
    port0: Option<SharedPort0>,
    pubsub_port: Option<SharedPubSubBridge>,
}

impl fmt::Debug for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stack")
            .field("mode", &self.mode)
            .field("finalized", &self.is_finalized())
            .finish_non_exhaustive()
    }
}

impl Stack {
    /// Construct and wire every layer.
    ///
    /// On failure all layers built so far are released before the error is
    /// returned.
    pub fn initialize<F: LayerFactory>(
        factory: &mut F,
        link_config: &LinkConfig,
        mode: Port0Mode,
        topic_prefix: &str,
        evm: SharedEventManager,
        lower: Box<dyn LowerLevel>,
        pubsub: SharedPubSub,
    ) -> StackResult<Self> {
        let mut stack = Self {
            mode,
            evm,
            pubsub,
            dl: None,
            transport: None,
            port0: None,
            pubsub_port: None,
        };
        match stack.build(factory, link_config, topic_prefix, lower) {
            Ok(()) => {
                info!(%mode, topic_prefix, "Stack initialized");
                Ok(stack)
            }
            Err(e) => {
                error!(%mode, error = %e, "Stack initialization failed");
                stack.finalize();
                Err(e)
            }
        }
    }

    fn build<F: LayerFactory>(
        &mut self,
        factory: &mut F,
        link_config: &LinkConfig,
        topic_prefix: &str,
        lower: Box<dyn LowerLevel>,
    ) -> StackResult<()> {
        let dl = factory.data_link(link_config, &self.evm, lower)?;
        debug!(layer = %Layer::DataLink, "Layer constructed");
        let link_send = dl.send_path();
        let link_status = dl.status_source();
        self.dl = Some(dl);

        let transport = factory.transport(link_send)?;
        debug!(layer = %Layer::Transport, "Layer constructed");
        let upper: SharedLinkUpper = transport.clone();
        if let Some(dl) = self.dl.as_mut() {
            dl.register_upper_layer(upper);
        }
        let port_send = lock(&transport).send_path();
        self.transport = Some(transport.clone());

        let port0 = factory.port0(Port0Context {
            mode: self.mode,
            link: link_status,
            evm: &self.evm,
            transport: port_send.clone(),
            pubsub: &self.pubsub,
            topic_prefix,
        })?;
        debug!(layer = %Layer::Port0, "Layer constructed");
        self.port0 = Some(port0.clone());
        let handler: SharedPortHandler = port0;
        lock(&transport).register_port(PORT0_ID, PORT0_META, handler)?;

        let direction = self.mode.pubsub_direction().ok_or_else(|| {
            StackError::Config(format!("unsupported port0 mode '{}'", self.mode))
        })?;

        let bridge = factory.pubsub_bridge(&self.pubsub, &self.evm, direction)?;
        debug!(layer = %Layer::PubSubBridge, ?direction, "Layer constructed");
        self.pubsub_port = Some(bridge.clone());
        let handler: SharedPortHandler = bridge.clone();
        lock(&transport).register_port(PUBSUB_PORT_ID, PUBSUB_META, handler)?;
        lock(&bridge).attach(PUBSUB_PORT_ID, port_send);
        Ok(())
    }

    /// Release every layer: data-link, transport, port0, pubsub bridge.
    ///
    /// Safe to call on a partially built or already finalized stack.
    pub fn finalize(&mut self) {
        if self.is_finalized() {
            return;
        }
        if self.dl.take().is_some() {
            debug!(layer = %Layer::DataLink, "Layer released");
        }
        if self.transport.take().is_some() {
            debug!(layer = %Layer::Transport, "Layer released");
        }
        if self.port0.take().is_some() {
            debug!(layer = %Layer::Port0, "Layer released");
        }
        if self.pubsub_port.take().is_some() {
            debug!(layer = %Layer::PubSubBridge, "Layer released");
        }
        info!(mode = %self.mode, "Stack finalized");
    }

    /// Check if every layer has been released.
    pub fn is_finalized(&self) -> bool {
        self.dl.is_none()
            && self.transport.is_none()
            && self.port0.is_none()
            && self.pubsub_port.is_none()
    }

    /// Time until [`process`](Self::process) must run again, or `TIME_MAX`.
    pub fn interval_next(&self) -> i64 {
        let Some(dl) = self.dl.as_ref() else {
            return TIME_MAX;
        };
        let now = self.evm.timestamp();
        self.evm.interval_next(now).min(dl.service_interval())
    }

    /// Service the data-link layer, then run due timers.
    pub fn process(&mut self) {
        let Some(dl) = self.dl.as_mut() else {
            return;
        };
        dl.process();
        let now = self.evm.timestamp();
        self.evm.process(now);
    }

    /// Set or clear the mutex guarding the data-link receive path.
    pub fn mutex_set(&mut self, mutex: Option<LinkMutex>) {
        if let Some(dl) = self.dl.as_mut() {
            dl.register_mutex(mutex);
        }
    }

    /// Role of this end of the link.
    pub fn mode(&self) -> Port0Mode {
        self.mode
    }

    /// Shared event manager.
    pub fn evm(&self) -> &SharedEventManager {
        &self.evm
    }

    /// Shared pubsub store.
    pub fn pubsub(&self) -> &SharedPubSub {
        &self.pubsub
    }

    /// Data-link layer.
    pub fn data_link(&self) -> Option<&dyn DataLink> {
        self.dl.as_deref()
    }

    /// Data-link status.
    pub fn link_status(&self) -> Option<LinkStatus> {
        self.dl.as_ref().map(|dl| dl.status_source().link_status())
    }

    /// Transport layer.
    pub fn transport(&self) -> Option<&SharedTransport> {
        self.transport.as_ref()
    }

    /// Port0 layer.
    pub fn port0(&self) -> Option<&SharedPort0> {
        self.port0.as_ref()
    }

    /// Pubsub bridge.
    pub fn pubsub_bridge(&self) -> Option<&SharedPubSubBridge> {
        self.pubsub_port.as_ref()
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        self.finalize();
    }
}
