//! Transport Seam
//!
//! The lockstep session only needs two things from the network: send an
//! encoded frame to a peer, and drain frames that arrived since the last
//! tick. Reliability and per-link ordering are the transport's job.
//!
//! [`LoopbackNetwork`] connects sessions inside one process and can cut
//! links to simulate failures.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

/// Transport failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// No link to the player exists.
    #[error("no link to player {0}")]
    UnknownPeer(u8),

    /// The link existed but is gone.
    #[error("link to player {0} is closed")]
    Closed(u8),

    /// Socket-level failure.
    #[error("transport I/O failed: {0}")]
    Io(String),

    /// The remote end broke the connection handshake.
    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// Bytes received from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    /// Player on the other end of the link.
    pub from: u8,
    /// Encoded frame.
    pub bytes: Vec<u8>,
}

/// Sending half of the inbound queue, handed to I/O tasks.
pub type InboundSender = mpsc::UnboundedSender<InboundFrame>;

/// Receiving half of the inbound queue, drained by the session.
pub type InboundReceiver = mpsc::UnboundedReceiver<InboundFrame>;

/// Reliable, per-link ordered delivery of encoded frames.
pub trait Transport: Send {
    /// Queue `frame` for delivery to `to`.
    fn send(&mut self, to: u8, frame: &[u8]) -> Result<(), TransportError>;

    /// Next frame that arrived, if any. Never blocks.
    fn try_recv(&mut self) -> Option<InboundFrame>;
}

// =============================================================================
// LOOPBACK
// =============================================================================

#[derive(Debug, Default)]
struct Hub {
    endpoints: BTreeMap<u8, InboundSender>,
    cut: BTreeSet<(u8, u8)>,
}

fn link(a: u8, b: u8) -> (u8, u8) {
    (a.min(b), a.max(b))
}

/// In-process network connecting any number of endpoints.
#[derive(Debug, Clone, Default)]
pub struct LoopbackNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl LoopbackNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an endpoint for `player`, replacing any previous one.
    pub fn endpoint(&self, player: u8) -> LoopbackTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut hub) = self.hub.lock() {
            hub.endpoints.insert(player, tx);
            hub.cut.retain(|&(a, b)| a != player && b != player);
        }
        LoopbackTransport {
            player,
            hub: Arc::clone(&self.hub),
            inbound: rx,
        }
    }

    /// Sever the link between two players in both directions.
    pub fn cut(&self, a: u8, b: u8) {
        if let Ok(mut hub) = self.hub.lock() {
            hub.cut.insert(link(a, b));
        }
    }

    /// Restore a severed link.
    pub fn restore(&self, a: u8, b: u8) {
        if let Ok(mut hub) = self.hub.lock() {
            hub.cut.remove(&link(a, b));
        }
    }

    /// Remove a player's endpoint; sends to it fail from now on.
    pub fn disconnect(&self, player: u8) {
        if let Ok(mut hub) = self.hub.lock() {
            hub.endpoints.remove(&player);
        }
    }
}

/// One player's endpoint on a [`LoopbackNetwork`].
#[derive(Debug)]
pub struct LoopbackTransport {
    player: u8,
    hub: Arc<Mutex<Hub>>,
    inbound: InboundReceiver,
}

impl Transport for LoopbackTransport {
    fn send(&mut self, to: u8, frame: &[u8]) -> Result<(), TransportError> {
        let hub = self
            .hub
            .lock()
            .map_err(|_| TransportError::Io("loopback hub poisoned".to_string()))?;
        if hub.cut.contains(&link(self.player, to)) {
            return Err(TransportError::Closed(to));
        }
        let endpoint = hub.endpoints.get(&to).ok_or(TransportError::UnknownPeer(to))?;
        endpoint
            .send(InboundFrame {
                from: self.player,
                bytes: frame.to_vec(),
            })
            .map_err(|_| TransportError::Closed(to))
    }

    fn try_recv(&mut self) -> Option<InboundFrame> {
        self.inbound.try_recv().ok()
    }
}
