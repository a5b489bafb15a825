//! Per-topic readiness barrier.
//!
//! Every `configure` starts a round. A round is settled once the topic has no
//! outstanding lookups and every connection attempt attributed to the topic has
//! concluded. Rounds layer on the running totals, so a flush always means that no
//! attempt from any round is outstanding.

use std::collections::HashMap;

use chainnet_primitives::DiscoveryKey;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::trace;

use crate::events::EventEmitter;

#[derive(Debug, Default)]
struct FlushRecord {
    expected: u64,
    settled: u64,
    lookups_pending: u64,
    /// Rounds not yet reported, each with its `flush: true` waiter.
    rounds: Vec<oneshot::Sender<()>>,
}

impl FlushRecord {
    fn is_drained(&self) -> bool {
        self.lookups_pending == 0 && self.settled >= self.expected
    }
}

/// Handed out by [`FlushCoordinator::expect`]; settle it exactly once.
#[derive(Debug)]
#[must_use = "an expected attempt must be settled or the topic never flushes"]
pub(crate) struct FlushTicket {
    topic: DiscoveryKey,
}

#[derive(Debug)]
pub(crate) struct FlushCoordinator {
    records: Mutex<HashMap<DiscoveryKey, FlushRecord>>,
    events: EventEmitter,
}

impl FlushCoordinator {
    pub(crate) fn new(events: EventEmitter) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Start a round. The receiver resolves when the round settles or the
    /// coordinator is released.
    pub(crate) fn begin_round(&self, topic: DiscoveryKey, lookup: bool) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let fired = {
            let mut records = self.records.lock();
            let record = records.entry(topic).or_default();
            if lookup {
                record.lookups_pending += 1;
            }
            record.rounds.push(tx);
            trace!(topic = %topic.short(), rounds = record.rounds.len(), lookup, "flush round started");
            Self::take_drained(record)
        };
        self.notify(topic, fired);
        rx
    }

    /// Count one connection attempt against `topic`. `None` if the topic has no record.
    pub(crate) fn expect(&self, topic: DiscoveryKey) -> Option<FlushTicket> {
        let mut records = self.records.lock();
        let record = records.get_mut(&topic)?;
        record.expected += 1;
        Some(FlushTicket { topic })
    }

    /// Conclude an attempt counted by [`expect`](Self::expect).
    pub(crate) fn settle(&self, ticket: FlushTicket) {
        let topic = ticket.topic;
        let fired = {
            let mut records = self.records.lock();
            let Some(record) = records.get_mut(&topic) else {
                return;
            };
            record.settled += 1;
            Self::take_drained(record)
        };
        self.notify(topic, fired);
    }

    /// The lookup issued for a round has reported all candidates (or failed).
    pub(crate) fn lookup_complete(&self, topic: DiscoveryKey) {
        let fired = {
            let mut records = self.records.lock();
            let Some(record) = records.get_mut(&topic) else {
                return;
            };
            record.lookups_pending = record.lookups_pending.saturating_sub(1);
            Self::take_drained(record)
        };
        self.notify(topic, fired);
    }

    /// Drop the record of a discarded topic once nothing is outstanding on it.
    pub(crate) fn forget_if_idle(&self, topic: &DiscoveryKey) {
        let mut records = self.records.lock();
        if records
            .get(topic)
            .is_some_and(|r| r.is_drained() && r.rounds.is_empty())
        {
            records.remove(topic);
        }
    }

    /// Unblock every waiter at its current counts. Used on shutdown.
    pub(crate) fn release_all(&self) {
        let records = std::mem::take(&mut *self.records.lock());
        for (_, record) in records {
            for waiter in record.rounds {
                let _ = waiter.send(());
            }
        }
    }

    pub(crate) fn is_flushed(&self, topic: &DiscoveryKey) -> bool {
        self.records
            .lock()
            .get(topic)
            .is_none_or(|r| r.is_drained() && r.rounds.is_empty())
    }

    /// `(expected, settled)` for a topic.
    #[cfg(test)]
    pub(crate) fn counts(&self, topic: &DiscoveryKey) -> Option<(u64, u64)> {
        self.records
            .lock()
            .get(topic)
            .map(|r| (r.expected, r.settled))
    }

    fn take_drained(record: &mut FlushRecord) -> Vec<oneshot::Sender<()>> {
        if record.is_drained() {
            std::mem::take(&mut record.rounds)
        } else {
            Vec::new()
        }
    }

    fn notify(&self, topic: DiscoveryKey, fired: Vec<oneshot::Sender<()>>) {
        for waiter in fired {
            trace!(topic = %topic.short(), "flushed");
            self.events.flushed(topic);
            let _ = waiter.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::broadcast::error::TryRecvError;

    use super::*;
    use crate::events::NetworkerEvent;

    fn topic(n: u8) -> DiscoveryKey {
        DiscoveryKey::new([n; 32])
    }

    fn flushed_count(rx: &mut tokio::sync::broadcast::Receiver<NetworkerEvent>) -> usize {
        let mut n = 0;
        loop {
            match rx.try_recv() {
                Ok(NetworkerEvent::Flushed(_)) => n += 1,
                Ok(_) => {}
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return n,
                Err(TryRecvError::Lagged(_)) => {}
            }
        }
    }

    #[test]
    fn test_round_without_lookup_flushes_immediately() {
        let events = EventEmitter::default();
        let mut rx = events.subscribe();
        let flush = FlushCoordinator::new(events);

        let mut waiter = flush.begin_round(topic(1), false);
        assert!(waiter.try_recv().is_ok());
        assert_eq!(flushed_count(&mut rx), 1);
        assert!(flush.is_flushed(&topic(1)));
    }

    #[test]
    fn test_empty_lookup_flushes_on_complete() {
        let events = EventEmitter::default();
        let mut rx = events.subscribe();
        let flush = FlushCoordinator::new(events);

        let mut waiter = flush.begin_round(topic(1), true);
        assert!(waiter.try_recv().is_err());
        assert!(!flush.is_flushed(&topic(1)));

        flush.lookup_complete(topic(1));
        assert!(waiter.try_recv().is_ok());
        assert_eq!(flushed_count(&mut rx), 1);
    }

    #[test]
    fn test_waits_for_every_attempt() {
        let events = EventEmitter::default();
        let mut rx = events.subscribe();
        let flush = FlushCoordinator::new(events);

        let mut waiter = flush.begin_round(topic(1), true);
        let a = flush.expect(topic(1)).unwrap();
        let b = flush.expect(topic(1)).unwrap();
        flush.lookup_complete(topic(1));
        assert_eq!(flush.counts(&topic(1)), Some((2, 0)));

        flush.settle(a);
        assert!(waiter.try_recv().is_err());
        assert_eq!(flushed_count(&mut rx), 0);

        flush.settle(b);
        assert!(waiter.try_recv().is_ok());
        assert_eq!(flushed_count(&mut rx), 1);
    }

    #[test]
    fn test_flushed_once_per_round() {
        let events = EventEmitter::default();
        let mut rx = events.subscribe();
        let flush = FlushCoordinator::new(events);

        let _first = flush.begin_round(topic(1), true);
        flush.lookup_complete(topic(1));
        assert_eq!(flushed_count(&mut rx), 1);

        // attempts outside any round do not produce extra notifications
        let late = flush.expect(topic(1)).unwrap();
        flush.settle(late);
        assert_eq!(flushed_count(&mut rx), 0);
    }

    #[test]
    fn test_layered_rounds_wait_for_older_attempts() {
        let events = EventEmitter::default();
        let mut rx = events.subscribe();
        let flush = FlushCoordinator::new(events);

        let _first = flush.begin_round(topic(1), true);
        let pending = flush.expect(topic(1)).unwrap();
        flush.lookup_complete(topic(1));

        let mut second = flush.begin_round(topic(1), true);
        flush.lookup_complete(topic(1));
        assert!(second.try_recv().is_err());

        flush.settle(pending);
        assert!(second.try_recv().is_ok());
        assert_eq!(flushed_count(&mut rx), 2);
    }

    #[test]
    fn test_topics_are_independent() {
        let flush = FlushCoordinator::new(EventEmitter::default());
        let mut one = flush.begin_round(topic(1), true);
        let mut two = flush.begin_round(topic(2), true);

        flush.lookup_complete(topic(2));
        assert!(one.try_recv().is_err());
        assert!(two.try_recv().is_ok());
    }

    #[test]
    fn test_expect_unknown_topic() {
        let flush = FlushCoordinator::new(EventEmitter::default());
        assert!(flush.expect(topic(9)).is_none());
    }

    #[test]
    fn test_release_all_unblocks_waiters() {
        let events = EventEmitter::default();
        let mut rx = events.subscribe();
        let flush = FlushCoordinator::new(events);

        let mut waiter = flush.begin_round(topic(1), true);
        let ticket = flush.expect(topic(1)).unwrap();
        flush.release_all();
        assert!(waiter.try_recv().is_ok());
        assert_eq!(flushed_count(&mut rx), 0);

        // settling after release is harmless
        flush.settle(ticket);
        assert!(flush.is_flushed(&topic(1)));
    }

    #[test]
    fn test_forget_if_idle() {
        let flush = FlushCoordinator::new(EventEmitter::default());
        let _waiter = flush.begin_round(topic(1), true);
        flush.forget_if_idle(&topic(1));
        assert!(flush.counts(&topic(1)).is_some());

        flush.lookup_complete(topic(1));
        flush.forget_if_idle(&topic(1));
        assert!(flush.counts(&topic(1)).is_none());
    }
}
