//! The peer stream contract and an in-process implementation.
//!
//! A peer stream is one framed connection to one remote store. Many chains
//! share it: each chain's traffic rides a sub-channel tagged by discovery
//! key, and a bare discovery-key frame announces/requests a chain. The
//! store's multiplexer answers announcements; chains exchange payload
//! frames whose bytes are opaque to the core.

use std::sync::Arc;

use chainstore_crypto::DiscoveryKey;
use tokio::sync::{broadcast, watch};

use crate::error::{StoreError, StoreResult};

/// One frame on a peer stream.
#[derive(Clone, Debug)]
pub enum StreamFrame {
    /// Announce interest in a chain by discovery key.
    Discovery(DiscoveryKey),
    /// Opaque chain traffic on the sub-channel for `discovery_key`.
    Payload {
        discovery_key: DiscoveryKey,
        bytes: Vec<u8>,
    },
    /// The remote closed the sub-channel (e.g. it does not hold the chain).
    ChannelClosed(DiscoveryKey),
}

/// A shared, multiplexed connection to one peer.
///
/// `subscribe` yields inbound frames; `send` emits outbound frames. Frame
/// delivery starts at subscription time: chains tolerate missed frames by
/// re-announcing state and never rely on replay.
pub trait PeerStream: Send + Sync + 'static {
    /// Whether this side initiated the connection.
    fn is_initiator(&self) -> bool;

    /// Send a frame to the remote. Fails once the stream is closed.
    fn send(&self, frame: StreamFrame) -> StoreResult<()>;

    /// Subscribe to inbound frames.
    fn subscribe(&self) -> broadcast::Receiver<StreamFrame>;

    /// Close the whole stream, both directions.
    fn close(&self);

    /// Returns `true` once the stream is closed.
    fn is_closed(&self) -> bool;

    /// Watch for the stream closing.
    fn closed(&self) -> watch::Receiver<bool>;

    /// Close only the sub-channel for one chain.
    fn close_channel(&self, discovery_key: &DiscoveryKey) {
        let _ = self.send(StreamFrame::ChannelClosed(*discovery_key));
    }
}

/// An in-process peer stream: two connected ends exchanging frames over
/// broadcast channels. The test double for a transport, and the way two
/// stores in one process replicate directly.
pub struct MemoryPeerStream {
    initiator: bool,
    outbound: broadcast::Sender<StreamFrame>,
    inbound: broadcast::Sender<StreamFrame>,
    closed_tx: Arc<watch::Sender<bool>>,
    closed_rx: watch::Receiver<bool>,
}

impl MemoryPeerStream {
    /// Create a connected pair: frames sent on one end arrive at the other.
    /// The first end is the initiator. Closing either end closes both.
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        const CAPACITY: usize = 1024;
        let (a_to_b, _) = broadcast::channel(CAPACITY);
        let (b_to_a, _) = broadcast::channel(CAPACITY);
        let (closed_tx, closed_rx) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);

        let a = Arc::new(Self {
            initiator: true,
            outbound: a_to_b.clone(),
            inbound: b_to_a.clone(),
            closed_tx: Arc::clone(&closed_tx),
            closed_rx: closed_rx.clone(),
        });
        let b = Arc::new(Self {
            initiator: false,
            outbound: b_to_a,
            inbound: a_to_b,
            closed_tx,
            closed_rx,
        });
        (a, b)
    }
}

impl PeerStream for MemoryPeerStream {
    fn is_initiator(&self) -> bool {
        self.initiator
    }

    fn send(&self, frame: StreamFrame) -> StoreResult<()> {
        if self.is_closed() {
            return Err(StoreError::StreamClosed);
        }
        // A send with no subscribers yet is not an error; the remote
        // re-syncs from announcements once it attaches.
        let _ = self.outbound.send(frame);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StreamFrame> {
        self.inbound.subscribe()
    }

    fn close(&self) {
        let _ = self.closed_tx.send(true);
    }

    fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }
}

impl std::fmt::Debug for MemoryPeerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPeerStream")
            .field("initiator", &self.initiator)
            .field("closed", &self.is_closed())
            .finish()
    }
}
