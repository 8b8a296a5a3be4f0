//! Retained-value topic store.
//!
//! Values are JSON. Local publishes are queued for forwarding across the
//! link; values arriving from the link are stored without being queued, so
//! the bridge never echoes an update back to where it came from.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::trace;

/// Topic store shared by the application and the pubsub bridge.
#[derive(Debug, Default)]
pub struct PubSub {
    topics: BTreeMap<String, Value>,
    pending: BTreeSet<String>,
}

impl PubSub {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a local value. Returns `false` if the retained value is unchanged.
    pub fn publish(&mut self, topic: &str, value: impl Into<Value>) -> bool {
        let value = value.into();
        if self.topics.get(topic) == Some(&value) {
            return false;
        }
        trace!(topic, %value, "publish");
        self.topics.insert(topic.to_string(), value);
        self.pending.insert(topic.to_string());
        true
    }

    /// Store a value received from the link.
    pub fn publish_remote(&mut self, topic: &str, value: Value) -> bool {
        if self.topics.get(topic) == Some(&value) {
            return false;
        }
        trace!(topic, %value, "publish remote");
        // A remote value supersedes any unforwarded local one.
        self.pending.remove(topic);
        self.topics.insert(topic.to_string(), value);
        true
    }

    /// Retained value for `topic`.
    pub fn query(&self, topic: &str) -> Option<&Value> {
        self.topics.get(topic)
    }

    /// All retained topics in lexical order.
    pub fn topics(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.topics.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of retained topics.
    pub fn len(&self) -> usize {
        self.topics.len()
    }

    /// Check if no topics are retained.
    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// Whether local updates are waiting to be forwarded.
    pub fn has_updates(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Drain local updates not yet forwarded.
    pub fn take_updates(&mut self) -> Vec<(String, Value)> {
        let pending = std::mem::take(&mut self.pending);
        pending
            .into_iter()
            .filter_map(|topic| {
                let value = self.topics.get(&topic)?.clone();
                Some((topic, value))
            })
            .collect()
    }

    /// Requeue `topic` for forwarding, e.g. after a failed send.
    pub fn requeue(&mut self, topic: &str) {
        if self.topics.contains_key(topic) {
            self.pending.insert(topic.to_string());
        }
    }

    /// Copy of every retained value whose topic starts with `prefix`.
    pub fn snapshot(&self, prefix: &str) -> Vec<(String, Value)> {
        self.topics
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
