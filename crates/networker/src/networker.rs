//! The networker: topic configuration, the discovery event loop and the public API.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chainnet_net_discovery::{Discovery, DiscoveryEvent};
use chainnet_net_transport::{Handshake, SignedHandshake};
use chainnet_primitives::{DiscoveryKey, KeyPair, PublicKey};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::auth::{AuthGate, Authenticator};
use crate::config::{NetworkerConfig, TopicOptions};
use crate::error::{NetworkerError, Result};
use crate::events::{EventEmitter, NetworkerEvent};
use crate::extension::{ExtensionDefinition, ExtensionFactory, ExtensionHandle, ExtensionRegistry};
use crate::flush::FlushCoordinator;
use crate::manager::PeerManager;
use crate::peer::{Peer, StreamInfo};
use crate::replicator::{NoopReplicator, Replicator};
use crate::topics::TopicRegistry;

/// State shared by the networker, its discovery loop and its peer manager.
pub(crate) struct Shared {
    pub(crate) key_pair: KeyPair,
    pub(crate) config: NetworkerConfig,
    pub(crate) discovery: Arc<dyn Discovery>,
    pub(crate) events: EventEmitter,
    pub(crate) flush: FlushCoordinator,
    pub(crate) topics: TopicRegistry,
    pub(crate) extensions: Arc<ExtensionRegistry>,
}

/// Finds peers for configured topics and keeps one replication session per peer.
///
/// Cloning yields another handle to the same networker.
#[derive(Clone)]
pub struct Networker {
    inner: Arc<NetworkerInner>,
}

struct NetworkerInner {
    shared: Arc<Shared>,
    manager: Arc<PeerManager>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Networker {
    pub fn builder() -> NetworkerBuilder {
        NetworkerBuilder::default()
    }

    /// A networker with a fresh identity and default settings.
    pub fn new(discovery: impl Discovery) -> Result<Self> {
        Self::builder().build(discovery)
    }

    /// Register `topic` and start announcing and looking it up as `options` says.
    ///
    /// Resolves once discovery accepted the requests, or with `flush` set, once every
    /// connection attempt of this round has concluded. Configuring a topic again
    /// overwrites its options and starts a new round.
    pub async fn configure(&self, topic: impl AsRef<[u8]>, options: TopicOptions) -> Result<()> {
        self.ensure_open()?;
        let topic = parse_topic(topic.as_ref())?;
        let shared = &self.inner.shared;

        let previous = shared.topics.upsert(topic, options);
        let flushed = shared.flush.begin_round(topic, options.lookup);
        if let Err(err) = shared.topics.request(topic, options, previous).await {
            if options.lookup {
                shared.flush.lookup_complete(topic);
            }
            shared.topics.restore(topic, previous);
            debug!(topic = %topic.short(), %err, "topic configuration rolled back");
            return Err(err);
        }
        debug!(topic = %topic.short(), announce = options.announce, lookup = options.lookup, "topic configured");

        self.inner.manager.open_topic(topic);
        if options.flush {
            let _ = flushed.await;
        }
        Ok(())
    }

    /// Stop discovering `topic` and detach it from every session. Unknown topics are a no-op.
    ///
    /// Connection attempts already under way still run to completion.
    pub async fn discard(&self, topic: impl AsRef<[u8]>) -> Result<()> {
        let topic = parse_topic(topic.as_ref())?;
        let shared = &self.inner.shared;
        let Some(options) = shared.topics.remove(&topic) else {
            return Ok(());
        };

        self.inner.manager.close_topic(&topic);
        shared.flush.forget_if_idle(&topic);
        if !self.is_closed() {
            shared.topics.withdraw(topic, options).await?;
        }
        debug!(topic = %topic.short(), "topic discarded");
        Ok(())
    }

    /// Register `definition` under `name` and bind it to every peer, now and later.
    pub fn register_extension(
        &self,
        name: impl AsRef<str>,
        definition: ExtensionDefinition,
    ) -> ExtensionHandle {
        let name = name.as_ref();
        let extensions = &self.inner.shared.extensions;
        extensions.register(name, definition, || self.peers());
        ExtensionHandle::new(name, Arc::clone(extensions))
    }

    /// Register an extension whose definition is built once per peer by `factory`.
    pub fn register_extension_with(
        &self,
        name: impl AsRef<str>,
        factory: impl ExtensionFactory,
    ) -> ExtensionHandle {
        let name = name.as_ref();
        let extensions = &self.inner.shared.extensions;
        extensions.register_factory(name, Arc::new(factory), || self.peers());
        ExtensionHandle::new(name, Arc::clone(extensions))
    }

    pub fn has_extension(&self, name: &str) -> bool {
        self.inner.shared.extensions.contains(name)
    }

    /// Stop discovery, release flush waiters and close every peer. Later calls return
    /// immediately.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let shared = &self.inner.shared;
        shared.flush.release_all();
        self.inner.shutdown.send_replace(true);

        for (topic, options) in shared.topics.clear() {
            if let Err(err) = shared.topics.withdraw(topic, options).await {
                trace!(topic = %topic.short(), %err, "withdraw on close failed");
            }
        }
        shared.discovery.close().await;

        let event_loop = self.inner.event_loop.lock().take();
        if let Some(handle) = event_loop {
            let _ = handle.await;
        }
        self.inner.manager.close().await;
        debug!(public_key = %shared.key_pair.public_key().short(), "networker closed");
        Ok(())
    }

    pub fn key_pair(&self) -> &KeyPair {
        &self.inner.shared.key_pair
    }

    pub fn public_key(&self) -> PublicKey {
        self.inner.shared.key_pair.public_key()
    }

    pub fn config(&self) -> &NetworkerConfig {
        &self.inner.shared.config
    }

    /// Currently admitted peers.
    pub fn peers(&self) -> Vec<Peer> {
        self.inner.manager.peers()
    }

    pub fn peer(&self, remote_public_key: &PublicKey) -> Option<Peer> {
        self.inner.manager.get(remote_public_key)
    }

    pub fn peer_count(&self) -> usize {
        self.inner.manager.peer_count()
    }

    /// Local and remote keys of every live session.
    pub fn streams(&self) -> Vec<StreamInfo> {
        self.peers().iter().map(Peer::stream).collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkerEvent> {
        self.inner.shared.events.subscribe()
    }

    pub fn topics(&self) -> Vec<DiscoveryKey> {
        self.inner.shared.topics.configured()
    }

    pub fn is_configured(&self, topic: impl AsRef<[u8]>) -> bool {
        parse_topic(topic.as_ref()).is_ok_and(|topic| self.inner.shared.topics.contains(&topic))
    }

    pub fn topic_options(&self, topic: impl AsRef<[u8]>) -> Option<TopicOptions> {
        let topic = parse_topic(topic.as_ref()).ok()?;
        self.inner.shared.topics.get(&topic)
    }

    /// Whether no connection attempt for `topic` is outstanding.
    pub fn is_flushed(&self, topic: &DiscoveryKey) -> bool {
        self.inner.shared.flush.is_flushed(topic)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(NetworkerError::Closed);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Networker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Networker")
            .field("public_key", &self.public_key())
            .field("peers", &self.peer_count())
            .field("topics", &self.inner.shared.topics)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for NetworkerInner {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.flush.release_all();
        self.shutdown.send_replace(true);
        for peer in self.manager.peers() {
            peer.session().close();
        }
    }
}

fn parse_topic(bytes: &[u8]) -> Result<DiscoveryKey> {
    DiscoveryKey::try_from(bytes).map_err(NetworkerError::InvalidTopic)
}

/// Routes discovery events into flush accounting and connection attempts.
async fn run_discovery(
    shared: Arc<Shared>,
    manager: Arc<PeerManager>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = async { let _ = shutdown.wait_for(|closed| *closed).await; } => break,
            event = shared.discovery.next_event() => event,
        };
        let Some(event) = event else {
            trace!("discovery closed");
            break;
        };

        match event {
            DiscoveryEvent::Found(candidate) => {
                if !shared.topics.contains(&candidate.topic) {
                    trace!(topic = %candidate.topic.short(), "candidate for discarded topic ignored");
                    continue;
                }
                let ticket = shared.flush.expect(candidate.topic);
                manager.dial(candidate, ticket);
            }
            DiscoveryEvent::LookupComplete { topic } => shared.flush.lookup_complete(topic),
            DiscoveryEvent::Incoming { topic, connection } => {
                let ticket = topic
                    .filter(|topic| shared.topics.contains(topic))
                    .and_then(|topic| shared.flush.expect(topic));
                manager.accept(topic, connection, ticket);
            }
        }
    }
}

/// Builder for [`Networker`].
#[derive(Default)]
pub struct NetworkerBuilder {
    key_pair: Option<KeyPair>,
    config: NetworkerConfig,
    authenticator: Option<Arc<dyn Authenticator>>,
    replicator: Option<Arc<dyn Replicator>>,
    handshake: Option<Arc<dyn Handshake>>,
}

impl NetworkerBuilder {
    /// Use this identity instead of the configured or a generated one.
    pub fn key_pair(mut self, key_pair: KeyPair) -> Self {
        self.key_pair = Some(key_pair);
        self
    }

    pub fn config(mut self, config: NetworkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Hook consulted before any remote identity becomes a peer.
    pub fn on_authenticate(mut self, authenticator: impl Authenticator) -> Self {
        self.authenticator = Some(Arc::new(authenticator));
        self
    }

    pub fn replicator(mut self, replicator: impl Replicator) -> Self {
        self.replicator = Some(Arc::new(replicator));
        self
    }

    /// Like [`replicator`](Self::replicator) for an already shared instance.
    pub fn replicator_arc(mut self, replicator: Arc<dyn Replicator>) -> Self {
        self.replicator = Some(replicator);
        self
    }

    /// Replace the signed handshake that authenticates every raw connection.
    ///
    /// Both ends of a connection must run compatible handshakes.
    pub fn handshake(mut self, handshake: impl Handshake) -> Self {
        self.handshake = Some(Arc::new(handshake));
        self
    }

    /// Resolve the identity this builder will use.
    fn resolve_key_pair(&mut self) -> Result<KeyPair> {
        if let Some(key_pair) = self.key_pair.take() {
            return Ok(key_pair);
        }
        Ok(self.config.key_pair()?.unwrap_or_else(KeyPair::generate))
    }

    /// Build on top of `discovery`. Must be called inside a tokio runtime.
    pub fn build(self, discovery: impl Discovery) -> Result<Networker> {
        self.build_with(|_| discovery)
    }

    /// Build with a discovery service that needs to know the local identity.
    pub fn build_with<D, F>(mut self, discovery: F) -> Result<Networker>
    where
        D: Discovery,
        F: FnOnce(&KeyPair) -> D,
    {
        self.config.validate()?;
        let key_pair = self.resolve_key_pair()?;
        let discovery: Arc<dyn Discovery> = Arc::new(discovery(&key_pair));

        let events = EventEmitter::new(self.config.event_channel_capacity);
        let shared = Arc::new(Shared {
            key_pair,
            config: self.config,
            discovery: Arc::clone(&discovery),
            events: events.clone(),
            flush: FlushCoordinator::new(events),
            topics: TopicRegistry::new(discovery),
            extensions: Arc::new(ExtensionRegistry::default()),
        });

        let replicator = self
            .replicator
            .unwrap_or_else(|| Arc::new(NoopReplicator));
        let handshake = self.handshake.unwrap_or_else(|| {
            Arc::new(
                SignedHandshake::new(shared.config.handshake_timeout())
                    .with_max_frame_size(shared.config.max_frame_size),
            )
        });
        let manager = Arc::new(PeerManager::new(
            Arc::clone(&shared),
            handshake,
            AuthGate::new(self.authenticator),
            replicator,
        ));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let event_loop = tokio::spawn(run_discovery(
            Arc::clone(&shared),
            Arc::clone(&manager),
            shutdown_rx,
        ));
        debug!(public_key = %shared.key_pair.public_key().short(), "networker started");

        Ok(Networker {
            inner: Arc::new(NetworkerInner {
                shared,
                manager,
                closed: AtomicBool::new(false),
                shutdown,
                event_loop: Mutex::new(Some(event_loop)),
            }),
        })
    }
}

impl std::fmt::Debug for NetworkerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkerBuilder")
            .field("key_pair", &self.key_pair)
            .field("config", &self.config)
            .field("authenticator", &self.authenticator.is_some())
            .field("handshake", &self.handshake.is_some())
            .finish_non_exhaustive()
    }
}
