//! Discovery collaborator: announce/lookup of topics and delivery of candidate
//! connections.
//!
//! The [`Discovery`] trait is what the networker consumes. [`MemoryDht`] is an
//! in-process implementation used by tests and the demo binary.

use std::fmt;

use async_trait::async_trait;
use chainnet_net_transport::FramedConnection;
use chainnet_primitives::{DiscoveryKey, PublicKey};

pub mod memory;

pub use memory::{MemoryDht, MemoryDiscovery};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Discovery closed")]
    Closed,
    #[error("Peer unreachable: {0}")]
    Unreachable(String),
}

/// A remote node found while looking up a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub topic: DiscoveryKey,
    /// Opaque address understood by the discovery implementation that produced it.
    pub address: String,
    /// Remote identity, when the discovery layer publishes it alongside the address.
    pub public_key: Option<PublicKey>,
}

/// Events emitted by a discovery implementation.
pub enum DiscoveryEvent {
    /// A remote node announcing `candidate.topic` was found.
    Found(Candidate),
    /// The lookup started for `topic` has reported everything it knows.
    LookupComplete { topic: DiscoveryKey },
    /// A remote node connected to us, possibly naming the topic it found us under.
    Incoming {
        topic: Option<DiscoveryKey>,
        connection: FramedConnection,
    },
}

impl DiscoveryEvent {
    pub fn topic(&self) -> Option<&DiscoveryKey> {
        match self {
            Self::Found(candidate) => Some(&candidate.topic),
            Self::LookupComplete { topic } => Some(topic),
            Self::Incoming { topic, .. } => topic.as_ref(),
        }
    }
}

impl fmt::Debug for DiscoveryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Found(candidate) => f.debug_tuple("Found").field(candidate).finish(),
            Self::LookupComplete { topic } => f
                .debug_struct("LookupComplete")
                .field("topic", topic)
                .finish(),
            Self::Incoming { topic, .. } => f
                .debug_struct("Incoming")
                .field("topic", topic)
                .finish_non_exhaustive(),
        }
    }
}

/// Topic discovery service.
///
/// Request methods resolve once the request has been accepted, not once peers are
/// found. Results arrive through [`Discovery::next_event`].
#[async_trait]
pub trait Discovery: Send + Sync + 'static {
    async fn announce(&self, topic: DiscoveryKey) -> Result<(), DiscoveryError>;

    async fn unannounce(&self, topic: DiscoveryKey) -> Result<(), DiscoveryError>;

    async fn lookup(&self, topic: DiscoveryKey) -> Result<(), DiscoveryError>;

    async fn stop_lookup(&self, topic: DiscoveryKey) -> Result<(), DiscoveryError>;

    /// Open a raw connection to a found candidate.
    async fn connect(&self, candidate: &Candidate) -> Result<FramedConnection, DiscoveryError>;

    /// Next event, or `None` once the service is closed.
    async fn next_event(&self) -> Option<DiscoveryEvent>;

    /// Stop all announcements and lookups. Idempotent.
    async fn close(&self);
}
