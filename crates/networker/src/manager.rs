//! Connection attempts, deduplication and the live peer set.
//!
//! Every candidate connection runs as its own task: handshake, identity reservation,
//! authentication, then a verdict exchange before admission. The acceptor decides first
//! and the dialer answers with its own verdict; neither side admits the peer until both
//! accepted, so a rejection on either end is never visible as a peer on the other.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chainnet_net_discovery::Candidate;
use chainnet_net_transport::{
    FramedConnection, Handshake, Role, SecureConnection, TransportError,
};
use chainnet_primitives::{DiscoveryKey, PublicKey};
use parking_lot::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::auth::AuthGate;
use crate::error::{NetworkerError, Result};
use crate::flush::FlushTicket;
use crate::networker::Shared;
use crate::peer::Peer;
use crate::registry::{ConnectionId, PeerRegistry, RegisterResult};
use crate::replicator::Replicator;
use crate::session::{Session, SessionFrame};

/// Holds an identity slot for one attempt and gives it back when dropped.
struct Reservation<'a> {
    registry: &'a PeerRegistry<Peer>,
    remote: PublicKey,
    id: ConnectionId,
}

impl Reservation<'_> {
    fn is_current(&self) -> bool {
        self.registry.is_current(&self.remote, self.id)
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        // no-op once admitted or superseded
        self.registry.release(&self.remote, self.id);
    }
}

pub(crate) struct PeerManager {
    shared: Arc<Shared>,
    handshake: Arc<dyn Handshake>,
    auth: AuthGate,
    replicator: Arc<dyn Replicator>,
    registry: PeerRegistry<Peer>,
    next_id: AtomicU64,
    attempts: Mutex<JoinSet<()>>,
    sessions: Mutex<HashMap<ConnectionId, JoinHandle<()>>>,
    closed: AtomicBool,
}

impl PeerManager {
    pub(crate) fn new(
        shared: Arc<Shared>,
        handshake: Arc<dyn Handshake>,
        auth: AuthGate,
        replicator: Arc<dyn Replicator>,
    ) -> Self {
        Self {
            shared,
            handshake,
            auth,
            replicator,
            registry: PeerRegistry::new(),
            next_id: AtomicU64::new(1),
            attempts: Mutex::new(JoinSet::new()),
            sessions: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn peers(&self) -> Vec<Peer> {
        self.registry.live()
    }

    pub(crate) fn peer_count(&self) -> usize {
        self.registry.len()
    }

    pub(crate) fn get(&self, remote: &PublicKey) -> Option<Peer> {
        self.registry.get(remote)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Dial a discovered candidate. `ticket` is settled once the attempt concludes.
    pub(crate) fn dial(self: &Arc<Self>, candidate: Candidate, ticket: Option<FlushTicket>) {
        let manager = Arc::clone(self);
        self.spawn_attempt(async move {
            let result = manager.try_dial(&candidate).await;
            log_attempt(Role::Initiator, Some(&candidate.topic), &result);
            if let Some(ticket) = ticket {
                manager.shared.flush.settle(ticket);
            }
        });
    }

    /// Accept an inbound connection. `ticket` is settled once the attempt concludes.
    pub(crate) fn accept(
        self: &Arc<Self>,
        topic: Option<DiscoveryKey>,
        connection: FramedConnection,
        ticket: Option<FlushTicket>,
    ) {
        let manager = Arc::clone(self);
        self.spawn_attempt(async move {
            let result = manager.try_accept(connection).await;
            log_attempt(Role::Responder, topic.as_ref(), &result);
            if let Some(ticket) = ticket {
                manager.shared.flush.settle(ticket);
            }
        });
    }

    /// Announce `topic` on every live session.
    pub(crate) fn open_topic(&self, topic: DiscoveryKey) {
        for peer in self.registry.live() {
            if let Err(err) = peer.session().open_topic(topic) {
                debug!(peer = %peer.remote_public_key().short(), %err, "failed to open topic");
            }
        }
    }

    /// Withdraw `topic` from every live session.
    pub(crate) fn close_topic(&self, topic: &DiscoveryKey) {
        for peer in self.registry.live() {
            if let Err(err) = peer.session().close_topic(topic) {
                debug!(peer = %peer.remote_public_key().short(), %err, "failed to close topic");
            }
        }
    }

    /// Abort pending attempts, close every session and wait for all of them to finish.
    pub(crate) async fn close(&self) {
        let sessions: Vec<JoinHandle<()>> = {
            let mut sessions = self.sessions.lock();
            self.closed.store(true, Ordering::Release);
            sessions.drain().map(|(_, handle)| handle).collect()
        };

        let mut attempts = std::mem::take(&mut *self.attempts.lock());
        attempts.abort_all();

        for peer in self.registry.live() {
            peer.session().close();
        }
        debug!(sessions = sessions.len(), attempts = attempts.len(), "closing peers");

        for handle in sessions {
            let _ = handle.await;
        }
        while attempts.join_next().await.is_some() {}
        self.registry.clear();
    }

    fn spawn_attempt(&self, attempt: impl Future<Output = ()> + Send + 'static) {
        if self.is_closed() {
            return;
        }
        let mut attempts = self.attempts.lock();
        while attempts.try_join_next().is_some() {}
        attempts.spawn(attempt);
    }

    fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn reserve_outbound(&self, remote: PublicKey, id: ConnectionId) -> Result<Reservation<'_>> {
        match self.registry.reserve_outbound(remote, id) {
            RegisterResult::Proceed => Ok(Reservation {
                registry: &self.registry,
                remote,
                id,
            }),
            result => {
                trace!(peer = %remote.short(), ?result, "dial skipped");
                Err(NetworkerError::DuplicateConnection(remote))
            }
        }
    }

    async fn try_dial(self: &Arc<Self>, candidate: &Candidate) -> Result<Peer> {
        let local = self.shared.key_pair.public_key();
        let id = self.next_id();

        // reserve before dialing when discovery tells us who is on the other end
        let mut reservation = match candidate.public_key {
            Some(remote) if remote == local => return Err(NetworkerError::Declined),
            Some(remote) => Some(self.reserve_outbound(remote, id)?),
            None => None,
        };

        let raw = self.shared.discovery.connect(candidate).await?;
        let SecureConnection {
            remote_public_key: remote,
            mut connection,
            ..
        } = self
            .handshake
            .upgrade(raw, &self.shared.key_pair, Role::Initiator)
            .await?;

        let reservation = match reservation.take() {
            Some(reservation) if reservation.remote == remote => reservation,
            Some(_) => {
                return Err(TransportError::Handshake(format!(
                    "expected {}, authenticated {}",
                    candidate.public_key.map(|k| k.short()).unwrap_or_default(),
                    remote.short()
                ))
                .into());
            }
            None => self.reserve_outbound(remote, id)?,
        };

        if !self.recv_verdict(&mut connection).await? {
            return Err(NetworkerError::Declined);
        }
        if !reservation.is_current() {
            self.decline(&mut connection).await;
            return Err(NetworkerError::DuplicateConnection(remote));
        }
        if let Err(err) = self.auth.check(&remote).await {
            self.decline(&mut connection).await;
            return Err(err);
        }
        if !reservation.is_current() {
            self.decline(&mut connection).await;
            return Err(NetworkerError::DuplicateConnection(remote));
        }

        self.send_verdict(&mut connection, true).await?;
        self.admit(&reservation, Role::Initiator, connection)
    }

    async fn try_accept(self: &Arc<Self>, raw: FramedConnection) -> Result<Peer> {
        let local = self.shared.key_pair.public_key();
        let SecureConnection {
            remote_public_key: remote,
            mut connection,
            ..
        } = self
            .handshake
            .upgrade(raw, &self.shared.key_pair, Role::Responder)
            .await?;

        let id = self.next_id();
        let reservation = match self.registry.reserve_inbound(&local, remote, id) {
            RegisterResult::Proceed => Reservation {
                registry: &self.registry,
                remote,
                id,
            },
            result => {
                trace!(peer = %remote.short(), ?result, "inbound declined");
                self.decline(&mut connection).await;
                return Err(NetworkerError::DuplicateConnection(remote));
            }
        };

        if let Err(err) = self.auth.check(&remote).await {
            self.decline(&mut connection).await;
            return Err(err);
        }
        if !reservation.is_current() {
            self.decline(&mut connection).await;
            return Err(NetworkerError::DuplicateConnection(remote));
        }

        self.send_verdict(&mut connection, true).await?;
        // inbound reservations are never superseded, so only the dialer's answer matters
        if !self.recv_verdict(&mut connection).await? {
            return Err(NetworkerError::Declined);
        }
        self.admit(&reservation, Role::Responder, connection)
    }

    /// Turn a reserved, authenticated connection into a live peer and start its session.
    fn admit(
        self: &Arc<Self>,
        reservation: &Reservation<'_>,
        role: Role,
        connection: FramedConnection,
    ) -> Result<Peer> {
        let remote = reservation.remote;
        let (session, io) = Session::new(
            remote,
            Arc::clone(&self.replicator),
            self.shared.config.max_frame_size,
        );
        let peer = Peer::new(
            remote,
            self.shared.key_pair.public_key(),
            role,
            reservation.id,
            session,
        );

        let mut sessions = self.sessions.lock();
        if self.is_closed() {
            return Err(NetworkerError::Closed);
        }
        if !self.registry.admit(remote, reservation.id, peer.clone()) {
            return Err(NetworkerError::DuplicateConnection(remote));
        }

        // extensions and topics are wired before the peer-add event goes out
        self.shared.extensions.bind_peer(&peer);
        for topic in self.shared.topics.configured() {
            if let Err(err) = peer.session().open_topic(topic) {
                debug!(peer = %remote.short(), %err, "failed to open topic");
            }
        }
        self.shared.events.peer_added(peer.clone());

        let manager = Arc::clone(self);
        let task_peer = peer.clone();
        let handle = tokio::spawn(async move {
            io.run(task_peer.clone(), connection).await;
            manager.on_session_closed(&task_peer);
        });
        sessions.insert(reservation.id, handle);
        Ok(peer)
    }

    fn on_session_closed(&self, peer: &Peer) {
        self.sessions.lock().remove(&peer.connection_id());
        if let Some(peer) = self
            .registry
            .remove_live(&peer.remote_public_key(), peer.connection_id())
        {
            debug!(peer = %peer.remote_public_key().short(), "peer removed");
            self.shared.events.peer_removed(peer);
        }
    }

    async fn recv_verdict(&self, connection: &mut FramedConnection) -> Result<bool> {
        let frame = timeout(self.shared.config.handshake_timeout(), connection.recv())
            .await
            .map_err(|_| TransportError::Timeout)?;
        let bytes = match frame {
            Some(frame) => frame?,
            None => return Err(TransportError::Closed.into()),
        };
        match SessionFrame::decode(&bytes, self.shared.config.max_frame_size)? {
            SessionFrame::Verdict { accepted } => Ok(accepted),
            other => Err(TransportError::Handshake(format!("expected verdict, got {other:?}")).into()),
        }
    }

    async fn send_verdict(&self, connection: &mut FramedConnection, accepted: bool) -> Result<()> {
        let frame =
            SessionFrame::Verdict { accepted }.encode(self.shared.config.max_frame_size)?;
        connection.send(frame).await?;
        Ok(())
    }

    async fn decline(&self, connection: &mut FramedConnection) {
        let _ = self.send_verdict(connection, false).await;
        let _ = connection.close().await;
    }
}

impl std::fmt::Debug for PeerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerManager")
            .field("peers", &self.registry.len())
            .field("pending", &self.registry.pending_count())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn log_attempt(role: Role, topic: Option<&DiscoveryKey>, result: &Result<Peer>) {
    let topic = topic.map(|t| t.short()).unwrap_or_default();
    match result {
        Ok(peer) => debug!(
            peer = %peer.remote_public_key().short(),
            ?role,
            %topic,
            "peer added"
        ),
        Err(
            err @ (NetworkerError::DuplicateConnection(_)
            | NetworkerError::Declined
            | NetworkerError::Closed),
        ) => trace!(?role, %topic, %err, "connection attempt dropped"),
        Err(err @ NetworkerError::AuthenticationRejected(_)) => {
            debug!(?role, %topic, %err, "connection attempt rejected")
        }
        Err(err) => warn!(?role, %topic, %err, "connection attempt failed"),
    }
}
