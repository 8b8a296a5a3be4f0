use std::fmt;
use thiserror::Error;

/// Protocol layers owned by the stack orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layer {
    /// Data-link layer (framing, acknowledgement, retransmission).
    DataLink,
    /// Transport layer (port multiplexing).
    Transport,
    /// Port0 link negotiation and time synchronization.
    Port0,
    /// Pubsub bridge on port 1.
    PubSubBridge,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DataLink => write!(f, "data-link"),
            Self::Transport => write!(f, "transport"),
            Self::Port0 => write!(f, "port0"),
            Self::PubSubBridge => write!(f, "pubsub-bridge"),
        }
    }
}

/// Stack error types covering configuration, construction and runtime failures.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StackError {
    /// Configuration or initialization error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A layer could not be constructed.
    #[error("{layer} initialization failed: {reason}")]
    LayerInit {
        /// Layer that failed.
        layer: Layer,
        /// Failure description.
        reason: String,
    },

    /// A handler could not be registered on a transport port.
    #[error("port {port} registration failed: {reason}")]
    PortRegistration {
        /// Port number.
        port: u8,
        /// Failure description.
        reason: String,
    },

    /// A bounded queue or window has no room left.
    #[error("buffer full: capacity {capacity}")]
    BufferFull {
        /// Usable capacity of the full buffer.
        capacity: usize,
    },

    /// A message exceeds the maximum payload size.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge {
        /// Size of the rejected message.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The link is not connected to a peer.
    #[error("link not connected")]
    NotConnected,

    /// A round-trip time sample was malformed and has been rejected.
    #[error("time sample rejected: {0}")]
    TimeSample(String),

    /// Malformed frame or message received from the link.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Convenience type alias for stack operations.
pub type StackResult<T> = Result<T, StackError>;
