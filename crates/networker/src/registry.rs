//! Identity-keyed connection registry enforcing at most one peer per remote key.
//!
//! Every connection attempt reserves a slot for the remote identity before it may
//! authenticate or become visible. All transitions happen under one lock, so the
//! dedup decision is atomic per identity.

use std::collections::HashMap;

use chainnet_primitives::PublicKey;
use parking_lot::Mutex;

/// Process-unique id of one connection attempt.
pub type ConnectionId = u64;

/// Result of reserving a slot for a connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterResult {
    /// The attempt owns the slot and may continue.
    Proceed,
    /// A live peer already exists for this identity.
    AlreadyConnected,
    /// An attempt in the same direction is already in flight.
    Duplicate,
    /// A concurrent attempt in the other direction wins the tie-break.
    LostTieBreak,
}

impl RegisterResult {
    pub fn is_proceed(&self) -> bool {
        matches!(self, Self::Proceed)
    }
}

/// Whether an inbound connection from `remote` beats our own outbound attempt to it.
///
/// The connection opened by the greater public key always survives. Both ends
/// evaluate this with the arguments swapped and reach the same verdict about which
/// connection lives.
pub fn prefer_inbound(local: &PublicKey, remote: &PublicKey) -> bool {
    remote > local
}

#[derive(Debug)]
struct Slot<T> {
    outbound: Option<ConnectionId>,
    inbound: Option<ConnectionId>,
    live: Option<(ConnectionId, T)>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            outbound: None,
            inbound: None,
            live: None,
        }
    }
}

impl<T> Slot<T> {
    fn is_empty(&self) -> bool {
        self.outbound.is_none() && self.inbound.is_none() && self.live.is_none()
    }

    fn owns(&self, id: ConnectionId) -> bool {
        self.outbound == Some(id) || self.inbound == Some(id)
    }

    fn clear_pending(&mut self, id: ConnectionId) {
        if self.outbound == Some(id) {
            self.outbound = None;
        }
        if self.inbound == Some(id) {
            self.inbound = None;
        }
    }
}

/// Slots keyed by remote public key, holding pending attempts and the live value.
#[derive(Debug)]
pub struct PeerRegistry<T: Clone> {
    slots: Mutex<HashMap<PublicKey, Slot<T>>>,
}

impl<T: Clone> Default for PeerRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> PeerRegistry<T> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve the slot for a dial to `remote`.
    pub fn reserve_outbound(&self, remote: PublicKey, id: ConnectionId) -> RegisterResult {
        let mut slots = self.slots.lock();
        let slot = slots.entry(remote).or_default();

        let result = if slot.live.is_some() {
            RegisterResult::AlreadyConnected
        } else if slot.outbound.is_some() || slot.inbound.is_some() {
            RegisterResult::Duplicate
        } else {
            slot.outbound = Some(id);
            RegisterResult::Proceed
        };

        if slot.is_empty() {
            slots.remove(&remote);
        }
        result
    }

    /// Reserve the slot for a connection accepted from `remote`.
    ///
    /// If our own dial to `remote` is still in flight, the tie-break decides; when the
    /// inbound side wins the outbound reservation is dropped and that attempt will
    /// find itself superseded.
    pub fn reserve_inbound(
        &self,
        local: &PublicKey,
        remote: PublicKey,
        id: ConnectionId,
    ) -> RegisterResult {
        let mut slots = self.slots.lock();
        let slot = slots.entry(remote).or_default();

        let result = if slot.live.is_some() {
            RegisterResult::AlreadyConnected
        } else if slot.inbound.is_some() {
            RegisterResult::Duplicate
        } else if slot.outbound.is_some() {
            if prefer_inbound(local, &remote) {
                slot.outbound = None;
                slot.inbound = Some(id);
                RegisterResult::Proceed
            } else {
                RegisterResult::LostTieBreak
            }
        } else {
            slot.inbound = Some(id);
            RegisterResult::Proceed
        };

        if slot.is_empty() {
            slots.remove(&remote);
        }
        result
    }

    /// Whether attempt `id` still owns the slot for `remote`.
    pub fn is_current(&self, remote: &PublicKey, id: ConnectionId) -> bool {
        self.slots
            .lock()
            .get(remote)
            .is_some_and(|slot| slot.owns(id) && slot.live.is_none())
    }

    /// Promote attempt `id` to the live value. Fails if it no longer owns the slot.
    pub fn admit(&self, remote: PublicKey, id: ConnectionId, value: T) -> bool {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(&remote) else {
            return false;
        };
        if !slot.owns(id) || slot.live.is_some() {
            return false;
        }
        slot.clear_pending(id);
        slot.live = Some((id, value));
        true
    }

    /// Give up the reservation of a failed attempt. No-op if it was superseded.
    pub fn release(&self, remote: &PublicKey, id: ConnectionId) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(remote) {
            slot.clear_pending(id);
            if slot.is_empty() {
                slots.remove(remote);
            }
        }
    }

    /// Remove the live value for `remote` if it was admitted by attempt `id`.
    pub fn remove_live(&self, remote: &PublicKey, id: ConnectionId) -> Option<T> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(remote)?;
        let value = match slot.live.take() {
            Some((live_id, value)) if live_id == id => value,
            other => {
                slot.live = other;
                return None;
            }
        };
        if slot.is_empty() {
            slots.remove(remote);
        }
        Some(value)
    }

    pub fn get(&self, remote: &PublicKey) -> Option<T> {
        self.slots
            .lock()
            .get(remote)
            .and_then(|slot| slot.live.as_ref().map(|(_, value)| value.clone()))
    }

    pub fn contains(&self, remote: &PublicKey) -> bool {
        self.get(remote).is_some()
    }

    /// Whether anything, live or pending, occupies the slot for `remote`.
    pub fn is_busy(&self, remote: &PublicKey) -> bool {
        self.slots.lock().contains_key(remote)
    }

    pub fn live(&self) -> Vec<T> {
        self.slots
            .lock()
            .values()
            .filter_map(|slot| slot.live.as_ref().map(|(_, value)| value.clone()))
            .collect()
    }

    /// Number of live values.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| slot.live.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_count(&self) -> usize {
        self.slots
            .lock()
            .values()
            .map(|slot| usize::from(slot.outbound.is_some()) + usize::from(slot.inbound.is_some()))
            .sum()
    }

    pub fn clear(&self) {
        self.slots.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn key(n: u8) -> PublicKey {
        PublicKey::new([n; 32])
    }

    #[test]
    fn test_registry_basic() {
        let registry = PeerRegistry::<&str>::new();
        assert!(registry.is_empty());

        assert_eq!(registry.reserve_outbound(key(1), 1), RegisterResult::Proceed);
        assert!(registry.is_current(&key(1), 1));
        assert!(registry.is_busy(&key(1)));
        assert!(!registry.contains(&key(1)));
        assert_eq!(registry.pending_count(), 1);

        assert!(registry.admit(key(1), 1, "peer"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&key(1)), Some("peer"));
        assert_eq!(registry.pending_count(), 0);
        assert!(!registry.is_current(&key(1), 1));
    }

    #[test]
    fn test_registry_rejects_while_live() {
        let registry = PeerRegistry::<u32>::new();
        assert!(registry.reserve_outbound(key(1), 1).is_proceed());
        assert!(registry.admit(key(1), 1, 10));

        assert_eq!(registry.reserve_outbound(key(1), 2), RegisterResult::AlreadyConnected);
        assert_eq!(
            registry.reserve_inbound(&key(0), key(1), 3),
            RegisterResult::AlreadyConnected
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_duplicate_same_direction() {
        let registry = PeerRegistry::<u32>::new();
        assert!(registry.reserve_outbound(key(1), 1).is_proceed());
        assert_eq!(registry.reserve_outbound(key(1), 2), RegisterResult::Duplicate);

        assert!(registry.reserve_inbound(&key(9), key(2), 3).is_proceed());
        assert_eq!(registry.reserve_inbound(&key(9), key(2), 4), RegisterResult::Duplicate);
    }

    #[test]
    fn test_registry_inbound_from_greater_key_supersedes_dial() {
        let registry = PeerRegistry::<u32>::new();
        let local = key(1);
        let remote = key(2);

        assert!(registry.reserve_outbound(remote, 1).is_proceed());
        assert_eq!(registry.reserve_inbound(&local, remote, 2), RegisterResult::Proceed);

        assert!(!registry.is_current(&remote, 1));
        assert!(!registry.admit(remote, 1, 100));
        assert!(registry.admit(remote, 2, 200));
        assert_eq!(registry.get(&remote), Some(200));
    }

    #[test]
    fn test_registry_inbound_from_lesser_key_loses() {
        let registry = PeerRegistry::<u32>::new();
        let local = key(2);
        let remote = key(1);

        assert!(registry.reserve_outbound(remote, 1).is_proceed());
        assert_eq!(
            registry.reserve_inbound(&local, remote, 2),
            RegisterResult::LostTieBreak
        );
        assert!(registry.is_current(&remote, 1));
        assert!(registry.admit(remote, 1, 100));
    }

    #[test]
    fn test_registry_release() {
        let registry = PeerRegistry::<u32>::new();
        assert!(registry.reserve_outbound(key(1), 1).is_proceed());
        registry.release(&key(1), 1);
        assert!(!registry.is_busy(&key(1)));

        // releasing a superseded attempt leaves the winner alone
        assert!(registry.reserve_outbound(key(2), 2).is_proceed());
        assert!(registry.reserve_inbound(&key(1), key(2), 3).is_proceed());
        registry.release(&key(2), 2);
        assert!(registry.is_current(&key(2), 3));
    }

    #[test]
    fn test_registry_remove_live_checks_connection() {
        let registry = PeerRegistry::<u32>::new();
        assert!(registry.reserve_outbound(key(1), 1).is_proceed());
        assert!(registry.admit(key(1), 1, 10));

        assert_eq!(registry.remove_live(&key(1), 99), None);
        assert!(registry.contains(&key(1)));

        assert_eq!(registry.remove_live(&key(1), 1), Some(10));
        assert_eq!(registry.remove_live(&key(1), 1), None);
        assert!(!registry.is_busy(&key(1)));
    }

    #[test]
    fn test_registry_multiple() {
        let registry = PeerRegistry::<u8>::new();
        for i in 1..=5u8 {
            assert!(registry.reserve_outbound(key(i), u64::from(i)).is_proceed());
            assert!(registry.admit(key(i), u64::from(i), i));
        }
        assert_eq!(registry.len(), 5);
        assert_eq!(registry.live().len(), 5);

        registry.clear();
        assert!(registry.is_empty());
    }

    proptest! {
        #[test]
        fn tie_break_is_symmetric(a in any::<[u8; 32]>(), b in any::<[u8; 32]>()) {
            prop_assume!(a != b);
            let a = PublicKey::new(a);
            let b = PublicKey::new(b);
            // exactly one side keeps the inbound connection, which is the other's dial
            prop_assert_ne!(prefer_inbound(&a, &b), prefer_inbound(&b, &a));
        }

        #[test]
        fn mutual_dial_converges(a in any::<[u8; 32]>(), b in any::<[u8; 32]>()) {
            prop_assume!(a != b);
            let a = PublicKey::new(a);
            let b = PublicKey::new(b);
            let on_a = PeerRegistry::<&str>::new();
            let on_b = PeerRegistry::<&str>::new();

            // both dial, then both accept the other's dial
            prop_assert!(on_a.reserve_outbound(b, 1).is_proceed());
            prop_assert!(on_b.reserve_outbound(a, 1).is_proceed());
            let a_keeps_inbound = on_a.reserve_inbound(&a, b, 2).is_proceed();
            let b_keeps_inbound = on_b.reserve_inbound(&b, a, 2).is_proceed();

            // the connection a dialed survives on a iff b kept it as inbound
            prop_assert_eq!(on_a.is_current(&b, 1), b_keeps_inbound);
            prop_assert_eq!(on_b.is_current(&a, 1), a_keeps_inbound);
            prop_assert_ne!(a_keeps_inbound, b_keeps_inbound);
        }
    }
}
