//! In-memory lower level joining two data-link layers.

use crate::layers::{lock, LinkInput, LowerLevel};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tether_common::error::StackResult;
use tracing::trace;

/// Bytes reported by [`LowerLevel::send_available`] for a pipe end.
pub const PIPE_SEND_AVAILABLE: usize = 4096;

#[derive(Default)]
struct PipeShared {
    inputs: [Mutex<Option<Arc<dyn LinkInput>>>; 2],
    drop_next: [AtomicU32; 2],
    sent: [AtomicU64; 2],
    dropped: [AtomicU64; 2],
}

/// Constructor for connected [`PipeEnd`] pairs.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedPipe;

impl SimulatedPipe {
    /// Create two connected ends. Frames sent on one end are delivered
    /// synchronously to the receive path bound on the other.
    pub fn pair() -> (PipeEnd, PipeEnd) {
        let shared = Arc::new(PipeShared::default());
        (
            PipeEnd {
                side: 0,
                shared: shared.clone(),
            },
            PipeEnd { side: 1, shared },
        )
    }
}

/// One end of a simulated pipe.
pub struct PipeEnd {
    side: usize,
    shared: Arc<PipeShared>,
}

impl PipeEnd {
    /// Fault injection handle for frames sent from this end.
    pub fn faults(&self) -> PipeFaults {
        PipeFaults {
            side: self.side,
            shared: self.shared.clone(),
        }
    }
}

impl LowerLevel for PipeEnd {
    fn bind(&mut self, input: Option<Arc<dyn LinkInput>>) {
        *lock(&self.shared.inputs[self.side]) = input;
    }

    fn send(&mut self, frame: &[u8]) -> StackResult<()> {
        let side = self.side;
        let drop_frame = self.shared.drop_next[side]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if drop_frame {
            self.shared.dropped[side].fetch_add(1, Ordering::Relaxed);
            trace!(side, len = frame.len(), "pipe frame dropped");
            return Ok(());
        }
        self.shared.sent[side].fetch_add(1, Ordering::Relaxed);

        // Release the slot lock before delivery; the peer may send in response.
        let peer = lock(&self.shared.inputs[1 - side]).clone();
        if let Some(peer) = peer {
            peer.recv(frame);
        }
        Ok(())
    }

    fn send_available(&self) -> usize {
        PIPE_SEND_AVAILABLE
    }
}

/// Fault injection and counters for one pipe direction.
#[derive(Clone)]
pub struct PipeFaults {
    side: usize,
    shared: Arc<PipeShared>,
}

impl PipeFaults {
    /// Silently drop the next `count` frames.
    pub fn drop_next(&self, count: u32) {
        self.shared.drop_next[self.side].store(count, Ordering::Release);
    }

    /// Frames delivered (or offered to an unbound peer).
    pub fn sent(&self) -> u64 {
        self.shared.sent[self.side].load(Ordering::Relaxed)
    }

    /// Frames dropped by fault injection.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped[self.side].load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Capture(Mutex<Vec<Vec<u8>>>);

    impl LinkInput for Capture {
        fn recv(&self, frame: &[u8]) {
            self.0.lock().unwrap().push(frame.to_vec());
        }
    }

    #[test]
    fn test_pair_delivers_to_peer() {
        let (mut a, mut b) = SimulatedPipe::pair();
        let capture = Arc::new(Capture::default());
        b.bind(Some(capture.clone()));

        a.send(&[1, 2, 3]).unwrap();
        // Unbound peer: frame is lost
        b.send(&[9]).unwrap();
        assert_eq!(*capture.0.lock().unwrap(), vec![vec![1, 2, 3]]);
        assert_eq!(a.send_available(), PIPE_SEND_AVAILABLE);
    }

    #[test]
    fn test_drop_next() {
        let (mut a, mut b) = SimulatedPipe::pair();
        let capture = Arc::new(Capture::default());
        b.bind(Some(capture.clone()));
        let faults = a.faults();
        faults.drop_next(2);

        for i in 0..4u8 {
            a.send(&[i]).unwrap();
        }
        assert_eq!(*capture.0.lock().unwrap(), vec![vec![2], vec![3]]);
        assert_eq!(faults.dropped(), 2);
        assert_eq!(faults.sent(), 2);

        b.bind(None);
        a.send(&[5]).unwrap();
        assert_eq!(capture.0.lock().unwrap().len(), 2);
    }
}
