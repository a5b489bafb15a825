//! Hand-off point to the replication protocol running inside topic channels.

use tracing::trace;

use crate::session::Channel;

/// Drives chain replication over an attached topic channel.
///
/// Called once per attachment, from the session task. Implementations are expected to
/// spawn their own work and return promptly; the channel's `recv` yields `None` once the
/// topic is detached or the session closes.
pub trait Replicator: Send + Sync + 'static {
    fn replicate(&self, channel: Channel);
}

impl<F> Replicator for F
where
    F: Fn(Channel) + Send + Sync + 'static,
{
    fn replicate(&self, channel: Channel) {
        (self)(channel)
    }
}

/// Accepts channels and discards whatever arrives on them.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReplicator;

impl Replicator for NoopReplicator {
    fn replicate(&self, mut channel: Channel) {
        tokio::spawn(async move {
            let mut dropped = 0usize;
            while channel.recv().await.is_some() {
                dropped += 1;
            }
            trace!(topic = %channel.topic().short(), dropped, "channel drained");
        });
    }
}
