//! In-memory append-only chains, optionally linked to a parent chain.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chainnet_primitives::{DiscoveryKey, PublicKey};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, watch};

const DISCOVERY_DOMAIN: &[u8] = b"chainnet-discovery";

/// Topic under which a chain is discovered.
pub fn discovery_key(key: &PublicKey) -> DiscoveryKey {
    let mut hasher = Sha256::new();
    hasher.update(DISCOVERY_DOMAIN);
    hasher.update(key.as_bytes());
    DiscoveryKey::new(hasher.finalize().into())
}

/// Changes published by a [`MemoryChainStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Created {
        key: PublicKey,
        parent: Option<PublicKey>,
    },
    Appended {
        key: PublicKey,
        length: u64,
    },
}

/// A replicated append-only log.
#[derive(Clone)]
pub struct Chain {
    inner: Arc<ChainInner>,
}

struct ChainInner {
    key: PublicKey,
    discovery_key: DiscoveryKey,
    parent: Option<PublicKey>,
    root: PublicKey,
    entries: RwLock<Vec<Bytes>>,
    length: watch::Sender<u64>,
    events: broadcast::Sender<StoreEvent>,
}

impl Chain {
    fn new(
        key: PublicKey,
        parent: Option<&Chain>,
        events: broadcast::Sender<StoreEvent>,
    ) -> Self {
        let (length, _) = watch::channel(0);
        Self {
            inner: Arc::new(ChainInner {
                key,
                discovery_key: discovery_key(&key),
                parent: parent.map(Chain::key),
                root: parent.map_or(key, Chain::root),
                entries: RwLock::new(Vec::new()),
                length,
                events,
            }),
        }
    }

    pub fn key(&self) -> PublicKey {
        self.inner.key
    }

    pub fn discovery_key(&self) -> DiscoveryKey {
        self.inner.discovery_key
    }

    pub fn parent(&self) -> Option<PublicKey> {
        self.inner.parent
    }

    /// Key of the top-level chain this chain descends from, or its own key.
    pub fn root(&self) -> PublicKey {
        self.inner.root
    }

    pub fn is_root(&self) -> bool {
        self.inner.parent.is_none()
    }

    pub fn len(&self) -> u64 {
        self.inner.entries.read().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append an entry, returning its index.
    pub fn append(&self, entry: impl Into<Bytes>) -> u64 {
        let length = {
            let mut entries = self.inner.entries.write();
            entries.push(entry.into());
            entries.len() as u64
        };
        self.published(length);
        length - 1
    }

    /// Entry at `index`, waiting until it exists.
    pub async fn get(&self, index: u64) -> Option<Bytes> {
        let mut length = self.inner.length.subscribe();
        length.wait_for(|length| *length > index).await.ok()?;
        self.get_now(index)
    }

    pub fn get_now(&self, index: u64) -> Option<Bytes> {
        let index = usize::try_from(index).ok()?;
        self.inner.entries.read().get(index).cloned()
    }

    /// Entries from `start` to the current end.
    pub fn range(&self, start: u64) -> Vec<Bytes> {
        let start = usize::try_from(start).unwrap_or(usize::MAX);
        self.inner
            .entries
            .read()
            .iter()
            .skip(start)
            .cloned()
            .collect()
    }

    /// Apply replicated entries starting at `start`. Entries the chain already has are
    /// skipped; a gap stops the write.
    pub fn apply(&self, start: u64, entries: impl IntoIterator<Item = Bytes>) -> u64 {
        let (added, length) = {
            let mut stored = self.inner.entries.write();
            let mut added = 0;
            for (index, entry) in (start..).zip(entries) {
                let length = stored.len() as u64;
                if index < length {
                    continue;
                }
                if index > length {
                    break;
                }
                stored.push(entry);
                added += 1;
            }
            (added, stored.len() as u64)
        };
        if added > 0 {
            self.published(length);
        }
        added
    }

    fn published(&self, length: u64) {
        self.inner.length.send_replace(length);
        let _ = self.inner.events.send(StoreEvent::Appended {
            key: self.inner.key,
            length,
        });
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("key", &self.inner.key)
            .field("parent", &self.inner.parent)
            .field("len", &self.len())
            .finish()
    }
}

/// Chains held by one test node.
pub struct MemoryChainStore {
    chains: RwLock<HashMap<PublicKey, Chain>>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for MemoryChainStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChainStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            chains: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// A new writable top-level chain.
    pub fn create(&self) -> Chain {
        self.insert(PublicKey::random(), None)
    }

    /// The top-level chain with `key`, created empty if unknown.
    pub fn get(&self, key: PublicKey) -> Chain {
        self.get_or_insert(key, None)
    }

    /// A new chain linked under `parent`.
    pub fn create_child(&self, parent: &Chain) -> Chain {
        self.insert(PublicKey::random(), Some(parent))
    }

    /// The child `key` of `parent`, created empty if unknown.
    pub fn get_child(&self, key: PublicKey, parent: &Chain) -> Chain {
        self.get_or_insert(key, Some(parent))
    }

    pub fn find(&self, key: &PublicKey) -> Option<Chain> {
        self.chains.read().get(key).cloned()
    }

    /// Top-level chain discovered under `topic`.
    pub fn by_discovery_key(&self, topic: &DiscoveryKey) -> Option<Chain> {
        self.chains
            .read()
            .values()
            .find(|chain| chain.is_root() && chain.discovery_key() == *topic)
            .cloned()
    }

    /// Every chain under the top-level chain `root`, including itself.
    pub fn tree(&self, root: &PublicKey) -> Vec<Chain> {
        self.chains
            .read()
            .values()
            .filter(|chain| chain.root() == *root)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.chains.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn insert(&self, key: PublicKey, parent: Option<&Chain>) -> Chain {
        let chain = Chain::new(key, parent, self.events.clone());
        self.chains.write().insert(key, chain.clone());
        let _ = self.events.send(StoreEvent::Created {
            key,
            parent: chain.parent(),
        });
        chain
    }

    fn get_or_insert(&self, key: PublicKey, parent: Option<&Chain>) -> Chain {
        if let Some(chain) = self.find(&key) {
            return chain;
        }
        let chain = {
            let mut chains = self.chains.write();
            if let Some(chain) = chains.get(&key) {
                return chain.clone();
            }
            let chain = Chain::new(key, parent, self.events.clone());
            chains.insert(key, chain.clone());
            chain
        };
        let _ = self.events.send(StoreEvent::Created {
            key,
            parent: chain.parent(),
        });
        chain
    }
}

impl fmt::Debug for MemoryChainStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryChainStore")
            .field("chains", &self.len())
            .finish()
    }
}
