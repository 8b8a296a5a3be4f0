//! Configuration structures for the link stack.
//!
//! Supports TOML deserialization with sensible defaults for
//! development and explicit values for deployment.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

/// Upper bound on [`LinkConfig::max_payload`].
pub const MAX_PAYLOAD_LIMIT: usize = 1024;

/// Top-level stack configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    /// Data-link layer configuration.
    pub link: LinkConfig,

    /// Port0 negotiation and time synchronization.
    pub port0: Port0Config,

    /// Pubsub bridge configuration.
    pub pubsub: PubSubConfig,

    /// Driver loop configuration.
    pub driver: DriverConfig,
}

/// Data-link layer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Number of slots in the transmit frame ring.
    pub tx_frame_count: u32,

    /// Maximum number of unacknowledged frames in flight.
    pub tx_window_size: u32,

    /// Maximum number of received frames buffered for the upper layer.
    pub rx_window_size: u32,

    /// Maximum message payload in bytes.
    pub max_payload: usize,

    /// Time to wait for an acknowledgement before retransmitting.
    #[serde(with = "humantime_serde")]
    pub tx_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            tx_frame_count: 64,
            tx_window_size: 16,
            rx_window_size: 16,
            max_payload: 256,
            tx_timeout: Duration::from_millis(15),
        }
    }
}

/// Port0 configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Port0Config {
    /// Role of this end of the link.
    pub mode: Port0Mode,

    /// Prefix for topics published by port0.
    pub topic_prefix: String,

    /// Period between round-trip time synchronization requests (client only).
    #[serde(with = "humantime_serde")]
    pub timesync_period: Duration,
}

impl Default for Port0Config {
    fn default() -> Self {
        Self {
            mode: Port0Mode::Client,
            topic_prefix: String::from("t/"),
            timesync_period: Duration::from_secs(1),
        }
    }
}

/// Pubsub bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PubSubConfig {
    /// Interval between forwarding batches of local updates to the peer.
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(10),
        }
    }
}

/// Driver loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Upper bound on a single sleep between process calls.
    #[serde(with = "humantime_serde")]
    pub max_sleep: Duration,

    /// Interval between status log lines.
    #[serde(with = "humantime_serde")]
    pub status_interval: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            max_sleep: Duration::from_millis(50),
            status_interval: Duration::from_secs(5),
        }
    }
}

/// Role of this end of the link.
///
/// Unrecognized values in configuration files parse to
/// [`Port0Mode::Unsupported`] and are rejected when the stack is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Port0Mode {
    /// Client (device) side; bridges pubsub upstream.
    #[default]
    Client,
    /// Server (host) side; bridges pubsub downstream.
    Server,
    /// Any other configured value.
    Unsupported,
}

impl Port0Mode {
    /// The pubsub bridge direction for this mode, if the mode is supported.
    #[must_use]
    pub fn pubsub_direction(&self) -> Option<PubSubDirection> {
        match self {
            Self::Client => Some(PubSubDirection::Upstream),
            Self::Server => Some(PubSubDirection::Downstream),
            Self::Unsupported => None,
        }
    }

    /// The mode of the opposite end of the link.
    #[must_use]
    pub fn peer(&self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
            Self::Unsupported => Self::Unsupported,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Server => "server",
            Self::Unsupported => "unsupported",
        }
    }
}

impl fmt::Display for Port0Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Port0Mode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "client" => Self::Client,
            "server" => Self::Server,
            _ => Self::Unsupported,
        })
    }
}

impl Serialize for Port0Mode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Port0Mode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let mode = s.parse().unwrap_or(Self::Unsupported);
        if mode == Self::Unsupported {
            warn!(mode = %s, "Unrecognized port0 mode");
        }
        Ok(mode)
    }
}

/// Direction of the pubsub bridge relative to this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PubSubDirection {
    /// This store feeds a store closer to the host.
    Upstream,
    /// This store is the authority for a store further from the host.
    Downstream,
}

impl fmt::Display for PubSubDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upstream => write!(f, "upstream"),
            Self::Downstream => write!(f, "downstream"),
        }
    }
}

impl StackConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        debug!(path = %path.display(), "Reading stack configuration");
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Check value ranges that the type system cannot express.
    ///
    /// The port0 mode is not checked here; an unsupported mode is reported
    /// by stack construction.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let link = &self.link;
        if link.tx_window_size == 0 || link.tx_window_size >= link.tx_frame_count {
            return Err(ConfigError::Invalid(format!(
                "link.tx_window_size must be in 1..{} (got {})",
                link.tx_frame_count, link.tx_window_size
            )));
        }
        if link.rx_window_size == 0 {
            return Err(ConfigError::Invalid("link.rx_window_size must be nonzero".into()));
        }
        if link.max_payload == 0 || link.max_payload > MAX_PAYLOAD_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "link.max_payload must be in 1..={MAX_PAYLOAD_LIMIT} (got {})",
                link.max_payload
            )));
        }
        if link.tx_timeout.is_zero() {
            return Err(ConfigError::Invalid("link.tx_timeout must be nonzero".into()));
        }
        if self.port0.timesync_period.is_zero() {
            return Err(ConfigError::Invalid("port0.timesync_period must be nonzero".into()));
        }
        if self.pubsub.flush_interval.is_zero() {
            return Err(ConfigError::Invalid("pubsub.flush_interval must be nonzero".into()));
        }
        Ok(())
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
