//! Node fixtures for networker tests.

use std::sync::Arc;
use std::time::Duration;

use chainnet_net_discovery::MemoryDht;
use chainnet_networker::{Networker, NetworkerBuilder, NetworkerEvent, Result, TopicOptions};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use crate::chain::{Chain, MemoryChainStore};
use crate::replicator::LogReplicator;

/// Default wait for anything asynchronous in a test.
pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Route `tracing` output through the test harness. Honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A networker on a [`MemoryDht`] replicating its own chain store.
#[derive(Debug)]
pub struct TestNode {
    pub networker: Networker,
    pub store: Arc<MemoryChainStore>,
}

impl TestNode {
    pub fn spawn(dht: &MemoryDht) -> Result<Self> {
        Self::spawn_with(dht, Networker::builder())
    }

    /// Spawn from a prepared builder. The replicator is always the node's log replicator.
    pub fn spawn_with(dht: &MemoryDht, builder: NetworkerBuilder) -> Result<Self> {
        let store = Arc::new(MemoryChainStore::new());
        let networker = builder
            .replicator(LogReplicator::new(Arc::clone(&store)))
            .build_with(|key_pair| dht.join(key_pair.public_key()))?;
        Ok(Self { networker, store })
    }

    /// Configure the topic of `chain` with default options.
    pub async fn replicate(&self, chain: &Chain) -> Result<()> {
        self.replicate_with(chain, TopicOptions::default()).await
    }

    pub async fn replicate_with(&self, chain: &Chain, options: TopicOptions) -> Result<()> {
        self.networker
            .configure(chain.discovery_key(), options)
            .await
    }

    pub async fn close(&self) -> Result<()> {
        self.networker.close().await
    }
}

/// Poll `condition` until it holds or `TIMEOUT` elapses.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    tokio::time::timeout(TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}

/// Next event accepted by `filter`, or `None` on timeout or a closed channel.
pub async fn next_event(
    events: &mut broadcast::Receiver<NetworkerEvent>,
    mut filter: impl FnMut(&NetworkerEvent) -> bool,
) -> Option<NetworkerEvent> {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) if filter(&event) => return Some(event),
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}
