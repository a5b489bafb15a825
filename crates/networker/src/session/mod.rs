//! Per-peer multiplexed session.
//!
//! A session carries every topic channel and every extension shared with one remote
//! identity over a single framed connection. Both sides announce the topics they have
//! configured with `Open`; a channel is attached only for topics both sides opened.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use chainnet_net_transport::FramedConnection;
use chainnet_primitives::{DiscoveryKey, PublicKey};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

mod channel;
pub(crate) mod frame;

pub use channel::{Channel, ChannelSender};
pub(crate) use frame::SessionFrame;

use crate::error::{NetworkerError, Result};
use crate::extension::ExtensionBinding;
use crate::peer::Peer;
use crate::replicator::Replicator;

#[derive(Default)]
struct SessionState {
    local_topics: HashSet<DiscoveryKey>,
    remote_topics: HashSet<DiscoveryKey>,
    channels: HashMap<DiscoveryKey, mpsc::UnboundedSender<Bytes>>,
    extensions: HashMap<String, Arc<ExtensionBinding>>,
}

pub(crate) struct Session {
    remote_public_key: PublicKey,
    outgoing: mpsc::UnboundedSender<Bytes>,
    state: Mutex<SessionState>,
    shutdown: watch::Sender<bool>,
    replicator: Arc<dyn Replicator>,
    max_frame_size: usize,
}

/// The I/O half of a session, consumed by [`SessionIo::run`].
pub(crate) struct SessionIo {
    outgoing: mpsc::UnboundedReceiver<Bytes>,
    shutdown: watch::Receiver<bool>,
}

impl Session {
    pub(crate) fn new(
        remote_public_key: PublicKey,
        replicator: Arc<dyn Replicator>,
        max_frame_size: usize,
    ) -> (Arc<Self>, SessionIo) {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let session = Arc::new(Self {
            remote_public_key,
            outgoing: outgoing_tx,
            state: Mutex::new(SessionState::default()),
            shutdown: shutdown_tx,
            replicator,
            max_frame_size,
        });
        let io = SessionIo {
            outgoing: outgoing_rx,
            shutdown: shutdown_rx,
        };
        (session, io)
    }

    pub(crate) fn remote_public_key(&self) -> PublicKey {
        self.remote_public_key
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Ask the session task to flush pending writes and close the transport.
    pub(crate) fn close(&self) {
        self.shutdown.send_replace(true);
    }

    /// Announce `topic` to the remote and attach it if the remote already opened it.
    pub(crate) fn open_topic(self: &Arc<Self>, topic: DiscoveryKey) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let channel = {
            let mut state = self.state.lock();
            if !state.local_topics.insert(topic) {
                return Ok(());
            }
            self.queue(&SessionFrame::Open { topic })?;
            if state.remote_topics.contains(&topic) {
                self.attach(&mut state, topic)
            } else {
                None
            }
        };
        if let Some(channel) = channel {
            self.replicator.replicate(channel);
        }
        Ok(())
    }

    /// Withdraw `topic`, detaching its channel and leaving the rest of the session open.
    pub(crate) fn close_topic(&self, topic: &DiscoveryKey) -> Result<()> {
        let mut state = self.state.lock();
        if !state.local_topics.remove(topic) {
            return Ok(());
        }
        if state.channels.remove(topic).is_some() {
            trace!(peer = %self.remote_public_key.short(), topic = %topic.short(), "detached");
        }
        if self.is_closed() {
            return Ok(());
        }
        self.queue(&SessionFrame::Close { topic: *topic })
    }

    pub(crate) fn is_attached(&self, topic: &DiscoveryKey) -> bool {
        !self.is_closed() && self.state.lock().channels.contains_key(topic)
    }

    pub(crate) fn attached_topics(&self) -> Vec<DiscoveryKey> {
        self.state.lock().channels.keys().copied().collect()
    }

    pub(crate) fn send_data(&self, topic: DiscoveryKey, payload: Bytes) -> Result<()> {
        if !self.is_attached(&topic) {
            return Err(NetworkerError::ChannelClosed(topic));
        }
        self.queue(&SessionFrame::Data {
            topic,
            payload: payload.to_vec(),
        })
        .map_err(|err| match err {
            NetworkerError::Closed => NetworkerError::ChannelClosed(topic),
            other => other,
        })
    }

    pub(crate) fn send_extension(&self, name: &str, payload: Vec<u8>) -> Result<()> {
        if self.is_closed() {
            return Err(NetworkerError::UnknownPeer(self.remote_public_key));
        }
        self.queue(&SessionFrame::Extension {
            name: name.to_owned(),
            payload,
        })
        .map_err(|err| match err {
            NetworkerError::Closed => NetworkerError::UnknownPeer(self.remote_public_key),
            other => other,
        })
    }

    /// Bind `binding` under `name`. An existing binding is kept unless `replace` is set.
    /// Returns whether the binding was installed.
    pub(crate) fn bind_extension(
        &self,
        name: &str,
        binding: Arc<ExtensionBinding>,
        replace: bool,
    ) -> bool {
        let mut state = self.state.lock();
        if !replace && state.extensions.contains_key(name) {
            return false;
        }
        state.extensions.insert(name.to_owned(), binding);
        true
    }

    pub(crate) fn extension(&self, name: &str) -> Option<Arc<ExtensionBinding>> {
        self.state.lock().extensions.get(name).cloned()
    }

    pub(crate) fn has_extension(&self, name: &str) -> bool {
        self.state.lock().extensions.contains_key(name)
    }

    fn queue(&self, frame: &SessionFrame) -> Result<()> {
        let bytes = frame.encode(self.max_frame_size)?;
        self.outgoing.send(bytes).map_err(|_| NetworkerError::Closed)
    }

    fn attach(self: &Arc<Self>, state: &mut SessionState, topic: DiscoveryKey) -> Option<Channel> {
        if state.channels.contains_key(&topic) {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.channels.insert(topic, tx);
        trace!(peer = %self.remote_public_key.short(), topic = %topic.short(), "attached");
        Some(Channel::new(topic, Arc::clone(self), rx))
    }

    fn handle_frame(self: &Arc<Self>, peer: &Peer, bytes: &[u8]) -> Result<()> {
        match SessionFrame::decode(bytes, self.max_frame_size)? {
            SessionFrame::Open { topic } => {
                let channel = {
                    let mut state = self.state.lock();
                    state.remote_topics.insert(topic);
                    if state.local_topics.contains(&topic) {
                        self.attach(&mut state, topic)
                    } else {
                        None
                    }
                };
                if let Some(channel) = channel {
                    self.replicator.replicate(channel);
                }
            }
            SessionFrame::Close { topic } => {
                let mut state = self.state.lock();
                state.remote_topics.remove(&topic);
                if state.channels.remove(&topic).is_some() {
                    trace!(peer = %self.remote_public_key.short(), topic = %topic.short(), "remote detached");
                }
            }
            SessionFrame::Data { topic, payload } => {
                let state = self.state.lock();
                match state.channels.get(&topic) {
                    Some(tx) => {
                        let _ = tx.send(Bytes::from(payload));
                    }
                    None => trace!(topic = %topic.short(), "data for detached topic dropped"),
                }
            }
            SessionFrame::Extension { name, payload } => match self.extension(&name) {
                Some(binding) => binding.deliver(&name, payload, peer),
                None => trace!(%name, "message for unregistered extension dropped"),
            },
            SessionFrame::Verdict { .. } => {
                trace!(peer = %self.remote_public_key.short(), "late verdict ignored");
            }
        }
        Ok(())
    }

    fn detach_all(&self) {
        let mut state = self.state.lock();
        state.channels.clear();
        state.remote_topics.clear();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("remote", &self.remote_public_key)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl SessionIo {
    /// Pump frames between the connection and the session until either side closes.
    pub(crate) async fn run(self, peer: Peer, connection: FramedConnection) {
        let SessionIo {
            mut outgoing,
            mut shutdown,
        } = self;
        let session = Arc::clone(peer.session());
        let (mut sink, mut stream) = connection.split();
        let mut writable = true;

        loop {
            tokio::select! {
                biased;
                _ = async { let _ = shutdown.wait_for(|closed| *closed).await; } => {
                    trace!(peer = %peer.remote_public_key().short(), "session shutdown requested");
                    break;
                }
                frame = outgoing.recv() => {
                    let Some(frame) = frame else { break };
                    if let Err(err) = sink.send(frame).await {
                        debug!(peer = %peer.remote_public_key().short(), %err, "session write failed");
                        writable = false;
                        break;
                    }
                }
                incoming = stream.next() => match incoming {
                    Some(Ok(bytes)) => {
                        if let Err(err) = session.handle_frame(&peer, &bytes) {
                            warn!(peer = %peer.remote_public_key().short(), %err, "closing session on bad frame");
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        debug!(peer = %peer.remote_public_key().short(), %err, "session read failed");
                        break;
                    }
                    None => {
                        trace!(peer = %peer.remote_public_key().short(), "remote closed session");
                        writable = false;
                        break;
                    }
                },
            }
        }

        session.shutdown.send_replace(true);
        // queued frames are only worth sending while the remote still reads
        while writable {
            let Ok(frame) = outgoing.try_recv() else { break };
            writable = sink.send(frame).await.is_ok();
        }
        if writable {
            let _ = sink.close().await;
        }
        session.detach_all();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chainnet_net_transport::Role;
    use tokio::time::timeout;

    use super::*;
    use crate::extension::{Encoding, ExtensionDefinition, ExtensionMessage};
    use crate::replicator::NoopReplicator;

    fn topic(n: u8) -> DiscoveryKey {
        DiscoveryKey::new([n; 32])
    }

    /// Two peers joined over an in-memory connection; channels land in the returned receivers.
    fn linked() -> (
        (Peer, mpsc::UnboundedReceiver<Channel>),
        (Peer, mpsc::UnboundedReceiver<Channel>),
    ) {
        let a_key = PublicKey::new([1; 32]);
        let b_key = PublicKey::new([2; 32]);
        let (a_conn, b_conn) = FramedConnection::pair();

        let spawn = |local: PublicKey, remote: PublicKey, role: Role, conn: FramedConnection| {
            let (tx, rx) = mpsc::unbounded_channel();
            let replicator = Arc::new(move |channel: Channel| {
                let _ = tx.send(channel);
            });
            let (session, io) = Session::new(remote, replicator, 1024);
            let peer = Peer::new(remote, local, role, 1, session);
            tokio::spawn(io.run(peer.clone(), conn));
            (peer, rx)
        };

        (
            spawn(a_key, b_key, Role::Initiator, a_conn),
            spawn(b_key, a_key, Role::Responder, b_conn),
        )
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Channel>) -> Channel {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_attaches_only_shared_topics() {
        let ((a, mut a_channels), (b, mut b_channels)) = linked();

        a.session().open_topic(topic(1)).unwrap();
        a.session().open_topic(topic(2)).unwrap();
        b.session().open_topic(topic(2)).unwrap();

        let on_a = next(&mut a_channels).await;
        let on_b = next(&mut b_channels).await;
        assert_eq!(on_a.topic(), &topic(2));
        assert_eq!(on_b.topic(), &topic(2));
        assert_eq!(on_a.remote_public_key(), b.remote_public_key());
        assert_eq!(a.topics(), vec![topic(2)]);
        assert!(a_channels.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_channel_bytes_are_opaque() {
        let ((a, mut a_channels), (b, mut b_channels)) = linked();
        a.session().open_topic(topic(1)).unwrap();
        b.session().open_topic(topic(1)).unwrap();

        let on_a = next(&mut a_channels).await;
        let mut on_b = next(&mut b_channels).await;

        on_a.send(Bytes::from_static(b"\x00\xffraw")).unwrap();
        let got = timeout(Duration::from_secs(5), on_b.recv()).await.unwrap();
        assert_eq!(got, Some(Bytes::from_static(b"\x00\xffraw")));
    }

    #[tokio::test]
    async fn test_open_topic_is_idempotent() {
        let ((a, mut a_channels), (b, mut b_channels)) = linked();
        b.session().open_topic(topic(1)).unwrap();
        a.session().open_topic(topic(1)).unwrap();
        a.session().open_topic(topic(1)).unwrap();

        let _on_a = next(&mut a_channels).await;
        let _on_b = next(&mut b_channels).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(a_channels.try_recv().is_err());
        assert!(b_channels.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_topic_detaches_only_that_topic() {
        let ((a, mut a_channels), (b, mut b_channels)) = linked();
        for t in [topic(1), topic(2)] {
            a.session().open_topic(t).unwrap();
            b.session().open_topic(t).unwrap();
        }
        let mut first = next(&mut b_channels).await;
        let mut second = next(&mut b_channels).await;
        let _ = next(&mut a_channels).await;
        let _ = next(&mut a_channels).await;
        if first.topic() != &topic(1) {
            std::mem::swap(&mut first, &mut second);
        }

        a.session().close_topic(&topic(1)).unwrap();
        let ended = timeout(Duration::from_secs(5), first.recv()).await.unwrap();
        assert_eq!(ended, None);
        assert!(first.send(Bytes::from_static(b"late")).is_err());
        assert!(!second.is_closed());
        assert!(!a.is_closed() && !b.is_closed());
    }

    #[tokio::test]
    async fn test_close_ends_both_sides() {
        let ((a, _a_channels), (b, mut b_channels)) = linked();
        a.session().open_topic(topic(1)).unwrap();
        b.session().open_topic(topic(1)).unwrap();
        let mut on_b = next(&mut b_channels).await;

        a.session().close();
        assert_eq!(timeout(Duration::from_secs(5), on_b.recv()).await.unwrap(), None);
        assert!(a.is_closed());
        timeout(Duration::from_secs(5), async {
            while !b.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(matches!(
            b.session().send_extension("x", vec![]),
            Err(NetworkerError::UnknownPeer(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_remote_close_with_queued_writes() {
        let a_key = PublicKey::new([1; 32]);
        let b_key = PublicKey::new([2; 32]);
        let (a_conn, b_conn) = FramedConnection::pair();

        let (a_session, a_io) = Session::new(b_key, Arc::new(NoopReplicator), 1024);
        let a = Peer::new(b_key, a_key, Role::Initiator, 1, a_session);
        let (b_session, b_io) = Session::new(a_key, Arc::new(NoopReplicator), 1024);
        let b = Peer::new(a_key, b_key, Role::Responder, 1, b_session);
        tokio::spawn(a_io.run(a.clone(), a_conn));
        let b_task = tokio::spawn(b_io.run(b.clone(), b_conn));

        for _ in 0..1000 {
            b.session().send_extension("bulk", vec![7; 64]).unwrap();
        }
        let writer = {
            let b = b.clone();
            tokio::spawn(async move {
                while b.session().send_extension("bulk", vec![7; 64]).is_ok() {
                    tokio::task::yield_now().await;
                }
            })
        };
        a.session().close();

        // the write side must wind down cleanly instead of panicking on a dead sink
        timeout(Duration::from_secs(5), b_task).await.unwrap().unwrap();
        assert!(b.is_closed());
        timeout(Duration::from_secs(5), writer).await.unwrap().unwrap();
        assert!(b.topics().is_empty());
    }

    #[tokio::test]
    async fn test_extension_delivery() {
        let ((a, _), (b, _)) = linked();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let definition = ExtensionDefinition::new(
            Encoding::Utf8,
            move |message: ExtensionMessage, from: &Peer| {
                let _ = tx.send((message, from.remote_public_key()));
            },
        );
        b.session()
            .bind_extension("chat", Arc::new(definition.binding()), false);

        a.session().send_extension("nobody", b"ignored".to_vec()).unwrap();
        a.session().send_extension("chat", b"hello".to_vec()).unwrap();

        let (message, from) = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message, ExtensionMessage::Text("hello".into()));
        assert_eq!(from, a.public_key());
    }
}
