//! Replicates a chain tree over a topic channel.
//!
//! Each side advertises the length of every chain in the tree rooted at the topic's
//! chain. A side that learns of entries it lacks requests them from its own length
//! onward. New appends and new child chains are advertised as they happen.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use chainnet_networker::{Channel, NetworkerError, Replicator};
use chainnet_primitives::PublicKey;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, trace};

use crate::chain::{Chain, MemoryChainStore, StoreEvent};

/// Upper bound on entries carried by one message.
const MAX_BATCH: usize = 64;

#[derive(Debug, Serialize, Deserialize)]
enum Message {
    Have {
        key: PublicKey,
        parent: Option<PublicKey>,
        length: u64,
    },
    Request {
        key: PublicKey,
        start: u64,
    },
    Entries {
        key: PublicKey,
        start: u64,
        entries: Vec<Vec<u8>>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error("Malformed replication message: {0}")]
    Codec(String),
    #[error(transparent)]
    Channel(#[from] NetworkerError),
}

/// [`Replicator`] backed by a [`MemoryChainStore`].
#[derive(Debug, Clone)]
pub struct LogReplicator {
    store: Arc<MemoryChainStore>,
}

impl LogReplicator {
    pub fn new(store: Arc<MemoryChainStore>) -> Self {
        Self { store }
    }
}

impl Replicator for LogReplicator {
    fn replicate(&self, channel: Channel) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            let topic = *channel.topic();
            match run(store, channel).await {
                Ok(()) => trace!(topic = %topic.short(), "replication ended"),
                Err(err) => debug!(topic = %topic.short(), %err, "replication failed"),
            }
        });
    }
}

async fn run(store: Arc<MemoryChainStore>, mut channel: Channel) -> Result<(), ReplicationError> {
    let Some(root) = store.by_discovery_key(channel.topic()) else {
        trace!(topic = %channel.topic().short(), "no local chain for topic");
        while channel.recv().await.is_some() {}
        return Ok(());
    };

    // subscribe first so nothing appended after the initial advertisement is missed
    let mut events = store.subscribe();
    advertise_tree(&store, &root, &channel)?;

    loop {
        tokio::select! {
            message = channel.recv() => {
                let Some(bytes) = message else { break };
                handle(&store, &root, &channel, &bytes)?;
            }
            event = events.recv() => match event {
                Ok(StoreEvent::Created { key, .. } | StoreEvent::Appended { key, .. }) => {
                    if let Some(chain) = in_tree(&store, &root, &key) {
                        send(&channel, &have(&chain))?;
                    }
                }
                Err(RecvError::Lagged(_)) => advertise_tree(&store, &root, &channel)?,
                Err(RecvError::Closed) => break,
            },
        }
    }
    Ok(())
}

fn handle(
    store: &MemoryChainStore,
    root: &Chain,
    channel: &Channel,
    bytes: &[u8],
) -> Result<(), ReplicationError> {
    let message: Message =
        postcard::from_bytes(bytes).map_err(|e| ReplicationError::Codec(e.to_string()))?;

    match message {
        Message::Have {
            key,
            parent,
            length,
        } => {
            let chain = match parent {
                None if key == root.key() => root.clone(),
                None => return Ok(()),
                Some(parent) => match in_tree(store, root, &parent) {
                    Some(parent) => store.get_child(key, &parent),
                    None => {
                        trace!(chain = %key.short(), "child of unknown parent ignored");
                        return Ok(());
                    }
                },
            };
            if chain.len() < length {
                send(
                    channel,
                    &Message::Request {
                        key,
                        start: chain.len(),
                    },
                )?;
            }
        }
        Message::Request { key, start } => {
            let Some(chain) = in_tree(store, root, &key) else {
                return Ok(());
            };
            let entries = chain.range(start);
            for (offset, batch) in entries.chunks(MAX_BATCH).enumerate() {
                send(
                    channel,
                    &Message::Entries {
                        key,
                        start: start + (offset * MAX_BATCH) as u64,
                        entries: batch.iter().map(|entry| entry.to_vec()).collect(),
                    },
                )?;
            }
        }
        Message::Entries {
            key,
            start,
            entries,
        } => {
            if let Some(chain) = in_tree(store, root, &key) {
                let added = chain.apply(start, entries.into_iter().map(Bytes::from));
                trace!(chain = %key.short(), start, added, "entries applied");
            }
        }
    }
    Ok(())
}

fn in_tree(store: &MemoryChainStore, root: &Chain, key: &PublicKey) -> Option<Chain> {
    store.find(key).filter(|chain| chain.root() == root.key())
}

/// Advertise every chain of the tree, parents before their children.
fn advertise_tree(
    store: &MemoryChainStore,
    root: &Chain,
    channel: &Channel,
) -> Result<(), ReplicationError> {
    let mut remaining = store.tree(&root.key());
    let mut sent = HashSet::new();
    while !remaining.is_empty() {
        let (ready, blocked): (Vec<Chain>, Vec<Chain>) = remaining
            .into_iter()
            .partition(|chain| chain.parent().is_none_or(|parent| sent.contains(&parent)));
        if ready.is_empty() {
            break;
        }
        for chain in ready {
            send(channel, &have(&chain))?;
            sent.insert(chain.key());
        }
        remaining = blocked;
    }
    Ok(())
}

fn have(chain: &Chain) -> Message {
    Message::Have {
        key: chain.key(),
        parent: chain.parent(),
        length: chain.len(),
    }
}

fn send(channel: &Channel, message: &Message) -> Result<(), ReplicationError> {
    let bytes = postcard::to_allocvec(message).map_err(|e| ReplicationError::Codec(e.to_string()))?;
    channel.send(bytes)?;
    Ok(())
}
