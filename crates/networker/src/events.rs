//! Networker events and non-blocking broadcast emitter.

use chainnet_primitives::DiscoveryKey;
use tokio::sync::broadcast;

use crate::peer::Peer;

/// Networker lifecycle events.
#[derive(Debug, Clone)]
pub enum NetworkerEvent {
    /// A peer passed the handshake, deduplication and authentication.
    PeerAdd(Peer),
    /// An admitted peer's transport closed.
    PeerRemove(Peer),
    /// Every attempt of a discovery round for this topic has settled.
    Flushed(DiscoveryKey),
}

impl NetworkerEvent {
    pub fn peer(&self) -> Option<&Peer> {
        match self {
            Self::PeerAdd(peer) | Self::PeerRemove(peer) => Some(peer),
            Self::Flushed(_) => None,
        }
    }

    pub fn is_peer_event(&self) -> bool {
        matches!(self, Self::PeerAdd(_) | Self::PeerRemove(_))
    }

    pub fn flushed_topic(&self) -> Option<&DiscoveryKey> {
        match self {
            Self::Flushed(topic) => Some(topic),
            _ => None,
        }
    }
}

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Non-blocking broadcast emitter. Slow subscribers drop events independently.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<NetworkerEvent>,
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: NetworkerEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkerEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn peer_added(&self, peer: Peer) {
        self.emit(NetworkerEvent::PeerAdd(peer));
    }

    pub fn peer_removed(&self, peer: Peer) {
        self.emit(NetworkerEvent::PeerRemove(peer));
    }

    pub fn flushed(&self, topic: DiscoveryKey) {
        self.emit(NetworkerEvent::Flushed(topic));
    }
}
