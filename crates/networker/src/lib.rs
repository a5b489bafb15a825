//! Peer discovery and replication-session orchestration.
//!
//! A [`Networker`] registers topics with a [`Discovery`](chainnet_net_discovery::Discovery)
//! service, connects to the nodes it finds, authenticates them and keeps exactly one
//! multiplexed session per remote identity. Topic channels on that session are handed to
//! a [`Replicator`]; named extensions carry application messages alongside them.

mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod extension;
mod flush;
mod manager;
mod networker;
pub mod peer;
pub mod registry;
pub mod replicator;
mod session;
mod topics;

pub use auth::{Authenticator, Rejection};
pub use config::{NetworkerConfig, TopicOptions};
pub use error::{NetworkerError, Result};
pub use events::{EventEmitter, NetworkerEvent};
pub use extension::{
    Encoding, ExtensionDefinition, ExtensionFactory, ExtensionHandle, ExtensionHandler,
    ExtensionMessage,
};
pub use networker::{Networker, NetworkerBuilder};
pub use peer::{Peer, StreamInfo};
pub use registry::{ConnectionId, PeerRegistry, RegisterResult, prefer_inbound};
pub use replicator::{NoopReplicator, Replicator};
pub use session::{Channel, ChannelSender};
