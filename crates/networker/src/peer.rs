//! Admitted peers.

use std::fmt;
use std::sync::Arc;

use chainnet_net_transport::Role;
use chainnet_primitives::{DiscoveryKey, PublicKey};

use crate::registry::ConnectionId;
use crate::session::Session;

/// A live, authenticated session with one remote identity.
///
/// Cheap to clone. Two `Peer` values are equal when they refer to the same connection.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

struct PeerInner {
    remote_public_key: PublicKey,
    public_key: PublicKey,
    role: Role,
    connection_id: ConnectionId,
    session: Arc<Session>,
}

impl Peer {
    pub(crate) fn new(
        remote_public_key: PublicKey,
        public_key: PublicKey,
        role: Role,
        connection_id: ConnectionId,
        session: Arc<Session>,
    ) -> Self {
        Self {
            inner: Arc::new(PeerInner {
                remote_public_key,
                public_key,
                role,
                connection_id,
                session,
            }),
        }
    }

    pub fn remote_public_key(&self) -> PublicKey {
        self.inner.remote_public_key
    }

    /// The local identity this session was authenticated with.
    pub fn public_key(&self) -> PublicKey {
        self.inner.public_key
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn is_initiator(&self) -> bool {
        self.inner.role.is_initiator()
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.inner.connection_id
    }

    /// Topics with an attached channel on this session.
    pub fn topics(&self) -> Vec<DiscoveryKey> {
        self.inner.session.attached_topics()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.session.is_closed()
    }

    pub fn stream(&self) -> StreamInfo {
        StreamInfo {
            public_key: self.public_key(),
            remote_public_key: self.remote_public_key(),
            role: self.role(),
        }
    }

    pub(crate) fn session(&self) -> &Arc<Session> {
        &self.inner.session
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.inner.connection_id == other.inner.connection_id
            && self.inner.remote_public_key == other.inner.remote_public_key
    }
}

impl Eq for Peer {}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("remote", &self.inner.remote_public_key)
            .field("role", &self.inner.role)
            .field("connection", &self.inner.connection_id)
            .finish()
    }
}

/// Snapshot of the keys on both ends of a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamInfo {
    pub public_key: PublicKey,
    pub remote_public_key: PublicKey,
    pub role: Role,
}
