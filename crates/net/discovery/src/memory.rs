//! In-process DHT: every node joined to the same [`MemoryDht`] can find and dial
//! every other node announcing a shared topic.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chainnet_net_transport::FramedConnection;
use chainnet_primitives::{DiscoveryKey, PublicKey};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::{Candidate, Discovery, DiscoveryError, DiscoveryEvent};

#[derive(Debug)]
struct NodeEntry {
    public_key: PublicKey,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    announced: HashSet<DiscoveryKey>,
}

#[derive(Debug, Default)]
struct DhtState {
    nodes: HashMap<String, NodeEntry>,
    next_id: u64,
}

/// Shared in-memory DHT. Clones refer to the same network.
#[derive(Debug, Clone, Default)]
pub struct MemoryDht {
    state: Arc<Mutex<DhtState>>,
}

impl MemoryDht {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node and return its discovery handle.
    pub fn join(&self, public_key: PublicKey) -> MemoryDiscovery {
        let (tx, rx) = mpsc::unbounded_channel();
        let address = {
            let mut state = self.state.lock();
            state.next_id += 1;
            let address = format!("mem://{}", state.next_id);
            state.nodes.insert(
                address.clone(),
                NodeEntry {
                    public_key,
                    events: tx.clone(),
                    announced: HashSet::new(),
                },
            );
            address
        };
        debug!(%address, node = %public_key.short(), "joined memory dht");

        let (closed_tx, _) = watch::channel(false);
        MemoryDiscovery {
            dht: self.clone(),
            address,
            public_key,
            events_tx: tx,
            events_rx: tokio::sync::Mutex::new(rx),
            lookups: Mutex::new(HashSet::new()),
            closed: closed_tx,
        }
    }

    pub fn node_count(&self) -> usize {
        self.state.lock().nodes.len()
    }

    /// Number of nodes currently announcing `topic`.
    pub fn announcers(&self, topic: &DiscoveryKey) -> usize {
        self.state
            .lock()
            .nodes
            .values()
            .filter(|n| n.announced.contains(topic))
            .count()
    }
}

/// One node's view of a [`MemoryDht`].
#[derive(Debug)]
pub struct MemoryDiscovery {
    dht: MemoryDht,
    address: String,
    public_key: PublicKey,
    events_tx: mpsc::UnboundedSender<DiscoveryEvent>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<DiscoveryEvent>>,
    lookups: Mutex<HashSet<DiscoveryKey>>,
    closed: watch::Sender<bool>,
}

impl MemoryDiscovery {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    pub fn is_looking_up(&self, topic: &DiscoveryKey) -> bool {
        self.lookups.lock().contains(topic)
    }

    fn ensure_open(&self) -> Result<(), DiscoveryError> {
        if *self.closed.borrow() {
            Err(DiscoveryError::Closed)
        } else {
            Ok(())
        }
    }

    fn set_announced(&self, topic: DiscoveryKey, announced: bool) -> Result<(), DiscoveryError> {
        let mut state = self.dht.state.lock();
        let entry = state
            .nodes
            .get_mut(&self.address)
            .ok_or(DiscoveryError::Closed)?;
        if announced {
            entry.announced.insert(topic);
        } else {
            entry.announced.remove(&topic);
        }
        Ok(())
    }
}

#[async_trait]
impl Discovery for MemoryDiscovery {
    async fn announce(&self, topic: DiscoveryKey) -> Result<(), DiscoveryError> {
        self.ensure_open()?;
        self.set_announced(topic, true)?;
        trace!(address = %self.address, topic = %topic.short(), "announced");
        Ok(())
    }

    async fn unannounce(&self, topic: DiscoveryKey) -> Result<(), DiscoveryError> {
        self.ensure_open()?;
        self.set_announced(topic, false)
    }

    async fn lookup(&self, topic: DiscoveryKey) -> Result<(), DiscoveryError> {
        self.ensure_open()?;
        self.lookups.lock().insert(topic);

        let found: Vec<Candidate> = {
            let state = self.dht.state.lock();
            state
                .nodes
                .iter()
                .filter(|(address, node)| {
                    **address != self.address && node.announced.contains(&topic)
                })
                .map(|(address, node)| Candidate {
                    topic,
                    address: address.clone(),
                    public_key: Some(node.public_key),
                })
                .collect()
        };
        trace!(address = %self.address, topic = %topic.short(), found = found.len(), "lookup");

        for candidate in found {
            let _ = self.events_tx.send(DiscoveryEvent::Found(candidate));
        }
        let _ = self.events_tx.send(DiscoveryEvent::LookupComplete { topic });
        Ok(())
    }

    async fn stop_lookup(&self, topic: DiscoveryKey) -> Result<(), DiscoveryError> {
        self.ensure_open()?;
        self.lookups.lock().remove(&topic);
        Ok(())
    }

    async fn connect(&self, candidate: &Candidate) -> Result<FramedConnection, DiscoveryError> {
        self.ensure_open()?;
        let target = {
            let state = self.dht.state.lock();
            state
                .nodes
                .get(&candidate.address)
                .map(|node| node.events.clone())
                .ok_or_else(|| DiscoveryError::Unreachable(candidate.address.clone()))?
        };

        let (local, remote) = FramedConnection::pair();
        target
            .send(DiscoveryEvent::Incoming {
                topic: Some(candidate.topic),
                connection: remote,
            })
            .map_err(|_| DiscoveryError::Unreachable(candidate.address.clone()))?;
        trace!(from = %self.address, to = %candidate.address, "connected");
        Ok(local)
    }

    async fn next_event(&self) -> Option<DiscoveryEvent> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return None;
        }
        let mut events = self.events_rx.lock().await;
        tokio::select! {
            event = events.recv() => event,
            _ = async { let _ = closed.wait_for(|closed| *closed).await; } => None,
        }
    }

    async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        self.lookups.lock().clear();
        self.dht.state.lock().nodes.remove(&self.address);
        debug!(address = %self.address, "left memory dht");
    }
}
