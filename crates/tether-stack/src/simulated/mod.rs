//! In-memory layer implementations.
//!
//! Two stacks built from [`SimulatedLayers`] and joined by a
//! [`SimulatedPipe`] exchange link, pubsub and time synchronization traffic
//! without hardware. Used by the daemon and the acceptance tests.

mod bridge;
mod data_link;
mod pipe;
mod port0;
mod transport;

pub use bridge::{BridgeStats, SimulatedPubSubBridge, OP_SYNC_REQ, OP_UPDATE};
pub use data_link::{SimulatedDataLink, MAX_RETRANSMIT_ROUNDS};
pub use pipe::{PipeEnd, PipeFaults, SimulatedPipe, PIPE_SEND_AVAILABLE};
pub use port0::{
    Port0Stats, SimulatedPort0, OP_STATUS_REQ, OP_STATUS_RSP, OP_TIMESYNC_REQ, OP_TIMESYNC_RSP,
};
pub use transport::{pack_metadata, unpack_metadata, SimulatedTransport};

use crate::layers::{
    FrameSink, LayerFactory, LowerLevel, Port0Context, SharedEventManager, SharedPubSub,
};
use crate::timesync::SharedTimeSync;
use std::sync::{Arc, Mutex};
use tether_common::config::{LinkConfig, PubSubDirection, StackConfig};
use tether_common::error::StackResult;
use tether_common::time::{duration_to_time, CounterSource};

/// [`LayerFactory`] producing the simulated layers.
pub struct SimulatedLayers {
    counter: Arc<dyn CounterSource>,
    timesync: Option<SharedTimeSync>,
    timesync_period: i64,
    flush_period: i64,
}

impl SimulatedLayers {
    /// Create a factory using periods from `config`.
    pub fn new(config: &StackConfig, counter: Arc<dyn CounterSource>) -> Self {
        Self {
            counter,
            timesync: None,
            timesync_period: duration_to_time(config.port0.timesync_period),
            flush_period: duration_to_time(config.pubsub.flush_interval),
        }
    }

    /// Feed time synchronization responses into `timesync`.
    pub fn with_timesync(mut self, timesync: SharedTimeSync) -> Self {
        self.timesync = Some(timesync);
        self
    }
}

impl LayerFactory for SimulatedLayers {
    type DataLink = SimulatedDataLink;
    type Transport = SimulatedTransport;
    type Port0 = SimulatedPort0;
    type PubSubBridge = SimulatedPubSubBridge;

    fn data_link(
        &mut self,
        config: &LinkConfig,
        evm: &SharedEventManager,
        lower: Box<dyn LowerLevel>,
    ) -> StackResult<Box<SimulatedDataLink>> {
        SimulatedDataLink::new(config, evm.clone(), lower).map(Box::new)
    }

    fn transport(
        &mut self,
        link: Arc<dyn FrameSink>,
    ) -> StackResult<Arc<Mutex<SimulatedTransport>>> {
        Ok(Arc::new(Mutex::new(SimulatedTransport::new(link))))
    }

    fn port0(&mut self, ctx: Port0Context<'_>) -> StackResult<Arc<Mutex<SimulatedPort0>>> {
        Ok(SimulatedPort0::new_shared(
            ctx,
            self.counter.clone(),
            self.timesync.clone(),
            self.timesync_period,
        ))
    }

    fn pubsub_bridge(
        &mut self,
        pubsub: &SharedPubSub,
        evm: &SharedEventManager,
        direction: PubSubDirection,
    ) -> StackResult<Arc<Mutex<SimulatedPubSubBridge>>> {
        Ok(SimulatedPubSubBridge::new_shared(
            pubsub,
            evm,
            direction,
            self.flush_period,
        ))
    }
}
