//! Topic channels handed to the replicator.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chainnet_primitives::{DiscoveryKey, PublicKey};
use tokio::sync::mpsc;

use super::Session;
use crate::error::Result;

/// One attached topic on a peer session.
///
/// Bytes are opaque to the session. `recv` returns `None` once the topic is detached on
/// either side or the session closes.
pub struct Channel {
    sender: ChannelSender,
    incoming: mpsc::UnboundedReceiver<Bytes>,
}

impl Channel {
    pub(super) fn new(
        topic: DiscoveryKey,
        session: Arc<Session>,
        incoming: mpsc::UnboundedReceiver<Bytes>,
    ) -> Self {
        Self {
            sender: ChannelSender { topic, session },
            incoming,
        }
    }

    pub fn topic(&self) -> &DiscoveryKey {
        &self.sender.topic
    }

    pub fn remote_public_key(&self) -> PublicKey {
        self.sender.remote_public_key()
    }

    pub fn send(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.sender.send(payload)
    }

    pub async fn recv(&mut self) -> Option<Bytes> {
        self.incoming.recv().await
    }

    /// Cloneable sending half, for replicators that write from several tasks.
    pub fn sender(&self) -> ChannelSender {
        self.sender.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("topic", &self.sender.topic)
            .field("remote", &self.sender.remote_public_key())
            .finish()
    }
}

#[derive(Clone)]
pub struct ChannelSender {
    topic: DiscoveryKey,
    session: Arc<Session>,
}

impl ChannelSender {
    pub fn topic(&self) -> &DiscoveryKey {
        &self.topic
    }

    pub fn remote_public_key(&self) -> PublicKey {
        self.session.remote_public_key()
    }

    /// Queue `payload` on the session. Fails with `ChannelClosed` once detached.
    pub fn send(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.session.send_data(self.topic, payload.into())
    }

    pub fn is_closed(&self) -> bool {
        !self.session.is_attached(&self.topic)
    }
}

impl fmt::Debug for ChannelSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSender")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}
