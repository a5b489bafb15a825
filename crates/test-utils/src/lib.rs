//! Test support for chainnet: an in-memory chain store, a replicator for it and
//! networker fixtures.

pub mod chain;
pub mod fixtures;
pub mod replicator;

pub use chain::{Chain, MemoryChainStore, StoreEvent, discovery_key};
pub use fixtures::{TIMEOUT, TestNode, init_tracing, next_event, wait_until};
pub use replicator::{LogReplicator, ReplicationError};
