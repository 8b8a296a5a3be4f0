//! Simulated port-multiplexing transport.
//!
//! Data-link metadata carries the port id in bits 0..5 and the 16-bit port
//! data in bits 8..24.

use crate::layers::{
    lock, FrameSink, LinkEvent, LinkUpper, PortSink, SharedPortHandler, Transport, PORT_COUNT,
};
use std::sync::Arc;
use tether_common::error::{StackError, StackResult};
use tracing::{debug, trace, warn};

const PORT_MASK: u32 = 0x1f;

/// Pack a port id and port data into data-link metadata.
pub fn pack_metadata(port_id: u8, port_data: u16) -> u32 {
    (u32::from(port_data) << 8) | (u32::from(port_id) & PORT_MASK)
}

/// Split data-link metadata into port id and port data.
pub fn unpack_metadata(metadata: u32) -> (u8, u16) {
    // Masked to 5 and 16 bits.
    ((metadata & PORT_MASK) as u8, (metadata >> 8) as u16)
}

struct TransportSink {
    link: Arc<dyn FrameSink>,
}

impl PortSink for TransportSink {
    fn send(&self, port_id: u8, port_data: u16, msg: &[u8]) -> StackResult<()> {
        if port_id >= PORT_COUNT {
            return Err(StackError::Protocol(format!("port {port_id} out of range")));
        }
        trace!(port_id, port_data, len = msg.len(), "port send");
        self.link.send(pack_metadata(port_id, port_data), msg)
    }
}

struct PortEntry {
    meta: String,
    handler: SharedPortHandler,
}

/// Transport dispatching data-link messages to per-port handlers.
pub struct SimulatedTransport {
    sink: Arc<TransportSink>,
    ports: Vec<Option<PortEntry>>,
    unknown_port_messages: u64,
}

impl SimulatedTransport {
    /// Create a transport sending through `link`.
    pub fn new(link: Arc<dyn FrameSink>) -> Self {
        Self {
            sink: Arc::new(TransportSink { link }),
            ports: (0..PORT_COUNT).map(|_| None).collect(),
            unknown_port_messages: 0,
        }
    }

    /// Ids of ports with a registered handler.
    pub fn registered_ports(&self) -> Vec<u8> {
        (0..PORT_COUNT)
            .filter(|&id| self.ports[usize::from(id)].is_some())
            .collect()
    }

    /// Messages received for ports without a handler.
    pub fn unknown_port_messages(&self) -> u64 {
        self.unknown_port_messages
    }
}

impl LinkUpper for SimulatedTransport {
    fn on_event(&mut self, event: LinkEvent) {
        debug!(?event, "Transport link event");
        for entry in self.ports.iter().flatten() {
            lock(&entry.handler).on_event(event);
        }
    }

    fn on_recv(&mut self, metadata: u32, msg: &[u8]) {
        let (port_id, port_data) = unpack_metadata(metadata);
        match &self.ports[usize::from(port_id)] {
            Some(entry) => lock(&entry.handler).on_recv(port_id, port_data, msg),
            None => {
                self.unknown_port_messages += 1;
                warn!(port_id, port_data, "Message for unregistered port dropped");
            }
        }
    }
}

impl Transport for SimulatedTransport {
    fn register_port(
        &mut self,
        port_id: u8,
        meta: &str,
        handler: SharedPortHandler,
    ) -> StackResult<()> {
        let reject = |reason: String| StackError::PortRegistration {
            port: port_id,
            reason,
        };
        let slot = self
            .ports
            .get_mut(usize::from(port_id))
            .ok_or_else(|| reject(format!("port id must be below {PORT_COUNT}")))?;
        if slot.is_some() {
            return Err(reject("port already registered".into()));
        }
        serde_json::from_str::<serde_json::Value>(meta)
            .map_err(|e| reject(format!("invalid metadata: {e}")))?;
        *slot = Some(PortEntry {
            meta: meta.to_string(),
            handler,
        });
        debug!(port_id, "Port registered");
        Ok(())
    }

    fn port_meta(&self, port_id: u8) -> Option<&str> {
        self.ports
            .get(usize::from(port_id))?
            .as_ref()
            .map(|entry| entry.meta.as_str())
    }

    fn send_path(&self) -> Arc<dyn PortSink> {
        self.sink.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{PortHandler, PORT0_META};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Sent(Mutex<Vec<(u32, Vec<u8>)>>);

    impl FrameSink for Sent {
        fn send(&self, metadata: u32, msg: &[u8]) -> StackResult<()> {
            self.0.lock().unwrap().push((metadata, msg.to_vec()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct Handler {
        events: Vec<LinkEvent>,
        received: Vec<(u8, u16, Vec<u8>)>,
    }

    impl PortHandler for Handler {
        fn on_event(&mut self, event: LinkEvent) {
            self.events.push(event);
        }

        fn on_recv(&mut self, port_id: u8, port_data: u16, msg: &[u8]) {
            self.received.push((port_id, port_data, msg.to_vec()));
        }
    }

    #[test]
    fn test_metadata_packing() {
        assert_eq!(unpack_metadata(pack_metadata(3, 0xbeef)), (3, 0xbeef));
        assert_eq!(pack_metadata(31, 1), 0x11f);
    }

    #[test]
    fn test_register_and_dispatch() {
        let sent = Arc::new(Sent::default());
        let mut transport = SimulatedTransport::new(sent.clone());
        let handler = Arc::new(Mutex::new(Handler::default()));
        transport.register_port(2, PORT0_META, handler.clone()).unwrap();
        assert_eq!(transport.port_meta(2), Some(PORT0_META));
        assert_eq!(transport.registered_ports(), vec![2]);

        transport.on_event(LinkEvent::Connected);
        transport.on_recv(pack_metadata(2, 9), b"abc");
        transport.on_recv(pack_metadata(5, 0), b"lost");
        assert_eq!(transport.unknown_port_messages(), 1);

        let h = handler.lock().unwrap();
        assert_eq!(h.events, vec![LinkEvent::Connected]);
        assert_eq!(h.received, vec![(2, 9, b"abc".to_vec())]);
        drop(h);

        transport.send_path().send(2, 7, b"out").unwrap();
        assert_eq!(*sent.0.lock().unwrap(), vec![(pack_metadata(2, 7), b"out".to_vec())]);
        assert!(transport.send_path().send(PORT_COUNT, 0, b"x").is_err());
    }

    #[test]
    fn test_rejects_bad_registration() {
        let mut transport = SimulatedTransport::new(Arc::new(Sent::default()));
        let handler = Arc::new(Mutex::new(Handler::default()));
        transport.register_port(0, "{}", handler.clone()).unwrap();

        for (port, meta) in [(0, "{}"), (PORT_COUNT, "{}"), (1, "not json")] {
            let err = transport.register_port(port, meta, handler.clone()).unwrap_err();
            assert!(matches!(err, StackError::PortRegistration { port: p, .. } if p == port));
        }
    }
}
