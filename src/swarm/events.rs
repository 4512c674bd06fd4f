use std::net::SocketAddr;
use tokio::sync::mpsc::UnboundedSender;

/// Progress notifications from a running swarm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwarmEvent {
    /// Payload bytes received from a peer.
    Downloaded { peer: SocketAddr, bytes: u64 },
    /// Payload bytes sent to a peer.
    Uploaded { peer: SocketAddr, bytes: u64 },
    PieceVerified { piece: u32 },
    /// A piece failed its hash check and will be fetched again.
    HashMismatch { piece: u32, peers: Vec<SocketAddr> },
    /// `checked` of `total` pieces re-hashed from disk.
    VerificationProgress { checked: usize, total: usize },
    PeerConnected { peer: SocketAddr },
    PeerDropped { peer: SocketAddr, reason: String },
    TrackerAnnounced { tracker: String, peers: usize },
    TrackerFailed { tracker: String, error: String },
    /// The info dictionary arrived from peers and hashed correctly.
    MetadataReceived { size: usize },
    /// Every piece is verified. Sent once.
    Finished,
    /// The download stopped on an unrecoverable error.
    Failed { error: String },
}

/// Receives [`SwarmEvent`]s. The engine never blocks on a sink.
pub trait ProgressSink {
    fn emit(&mut self, event: SwarmEvent);
}

impl ProgressSink for Vec<SwarmEvent> {
    fn emit(&mut self, event: SwarmEvent) {
        self.push(event);
    }
}

impl ProgressSink for UnboundedSender<SwarmEvent> {
    fn emit(&mut self, event: SwarmEvent) {
        // A closed receiver only means nobody is listening any more.
        let _ = self.send(event);
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&mut self, _event: SwarmEvent) {}
}
