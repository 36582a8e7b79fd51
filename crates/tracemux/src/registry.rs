//! The fixed-size session slot table.
//!
//! Sessions live in one of [`MAX_SESSIONS`] slots. Readers on the write path
//! never lock: they consult the `allow_write` bitmask and then load the slot
//! pointer, both atomics. All mutation happens under the engine's
//! configuration lock, so the atomics only have to make *readers* safe, not
//! arbitrate between writers.
//!
//! ## Teardown ordering
//!
//! Retiring a slot clears its `allow_write` bit before nulling the slot
//! pointer. A writer that saw the bit may still be holding the slot's `Arc`
//! through an [`arc_swap`] guard; the disable path then waits for per-thread
//! write markers to drain before flushing, so the final flush and sequence
//! point happen after every in-flight write has landed.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::{ArcSwapOption, Guard};

use crate::session::Session;
use crate::types::{SessionId, MAX_SESSIONS};

struct SessionSlot {
    session: ArcSwapOption<Session>,
    /// Bumped on every publish into this slot; makes ids single-use.
    generation: AtomicU64,
}

pub(crate) struct SessionRegistry {
    slots: [SessionSlot; MAX_SESSIONS],
    /// Bit `i` set when the session in slot `i` accepts writes.
    allow_write: AtomicU64,
    session_count: AtomicU32,
}

impl SessionRegistry {
    pub(crate) fn new() -> Self {
        SessionRegistry {
            slots: std::array::from_fn(|_| SessionSlot {
                session: ArcSwapOption::empty(),
                generation: AtomicU64::new(0),
            }),
            allow_write: AtomicU64::new(0),
            session_count: AtomicU32::new(0),
        }
    }

    /// Lowest-numbered empty slot, if any. Callers hold the configuration
    /// lock, so the answer stays valid until they release it.
    pub(crate) fn first_free_slot(&self) -> Option<usize> {
        (0..MAX_SESSIONS).find(|&slot| self.slots[slot].session.load().is_none())
    }

    /// Mints the id for the next occupant of `slot`. Each call bumps the
    /// slot's generation, so ids are never reused even when slots are.
    pub(crate) fn mint_id(&self, slot: usize) -> SessionId {
        let generation = self.slots[slot].generation.fetch_add(1, Ordering::Relaxed) + 1;
        SessionId::from_parts(generation, slot)
    }

    /// Makes a session visible to writers: slot pointer first, then the
    /// `allow_write` bit, then the count.
    pub(crate) fn publish(&self, session: Arc<Session>) {
        let slot = session.slot_index();
        debug_assert!(
            self.slots[slot].session.load().is_none(),
            "session slot published twice"
        );
        self.slots[slot].session.store(Some(session));
        self.allow_write.fetch_or(1 << slot, Ordering::SeqCst);
        self.session_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Hides a session from writers: `allow_write` bit first, then the slot
    /// pointer. Returns the occupant so the caller can drain and flush it.
    /// The session count is decremented separately, after quiescence.
    pub(crate) fn retire(&self, slot: usize) -> Option<Arc<Session>> {
        self.allow_write.fetch_and(!(1u64 << slot), Ordering::SeqCst);
        let previous = self.slots[slot].session.swap(None);
        debug_assert!(previous.is_some(), "session slot freed twice");
        previous
    }

    pub(crate) fn decrement_count(&self) {
        let previous = self.session_count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "session count underflow");
    }

    pub(crate) fn session_count(&self) -> u32 {
        self.session_count.load(Ordering::SeqCst)
    }

    /// Whether the session in `slot` currently accepts writes. Loaded fresh
    /// on every dispatch iteration; a disable between iterations is honored
    /// mid-fanout.
    #[inline(always)]
    pub(crate) fn slot_writable(&self, slot: usize) -> bool {
        self.allow_write.load(Ordering::SeqCst) & (1 << slot) != 0
    }

    /// Lock-free load of a slot. The guard keeps the session alive for the
    /// duration of the borrow even if the slot is concurrently retired.
    #[inline(always)]
    pub(crate) fn slot_guard(&self, slot: usize) -> Guard<Option<Arc<Session>>> {
        self.slots[slot].session.load()
    }

    pub(crate) fn load_full(&self, slot: usize) -> Option<Arc<Session>> {
        self.slots[slot].session.load_full()
    }

    /// Resolves an id to the live session it names, rejecting ids from
    /// earlier occupants of the same slot. The generation check makes stale
    /// ids fail fast; comparing the stored session's own id backstops it.
    pub(crate) fn lookup(&self, id: SessionId) -> Option<Arc<Session>> {
        let slot = id.slot();
        if slot >= MAX_SESSIONS {
            return None;
        }
        if self.slots[slot].generation.load(Ordering::Relaxed) != id.generation() {
            return None;
        }
        match self.load_full(slot) {
            Some(session) if session.id() == id => Some(session),
            _ => None,
        }
    }

    pub(crate) fn contains(&self, id: SessionId) -> bool {
        self.lookup(id).is_some()
    }

    /// Snapshot of every live session, lowest slot first.
    pub(crate) fn live_sessions(&self) -> Vec<Arc<Session>> {
        (0..MAX_SESSIONS)
            .filter_map(|slot| self.load_full(slot))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Session, SessionOptions};
    use crate::sink::NullSink;
    use crate::types::{SerializationFormat, SessionType};

    fn listener_session(registry: &SessionRegistry, slot: usize) -> Arc<Session> {
        let options = SessionOptions::new(SessionType::Listener, SerializationFormat::NetTrace4);
        let id = registry.mint_id(slot);
        Arc::new(Session::new(id, slot, &options, Arc::new(NullSink)))
    }

    #[test]
    fn test_publish_sets_bit_and_count() {
        let registry = SessionRegistry::new();
        let session = listener_session(&registry, 0);
        let id = session.id();
        registry.publish(session);
        assert!(registry.slot_writable(0));
        assert!(!registry.slot_writable(1));
        assert_eq!(registry.session_count(), 1);
        assert!(registry.contains(id));
    }

    #[test]
    fn test_retire_clears_bit_before_count() {
        let registry = SessionRegistry::new();
        let session = listener_session(&registry, 5);
        registry.publish(session);
        let retired = registry.retire(5);
        assert!(retired.is_some());
        assert!(!registry.slot_writable(5));
        assert!(registry.load_full(5).is_none());
        // The count drains later in the disable sequence.
        assert_eq!(registry.session_count(), 1);
        registry.decrement_count();
        assert_eq!(registry.session_count(), 0);
    }

    #[test]
    fn test_first_free_slot_is_lowest() {
        let registry = SessionRegistry::new();
        assert_eq!(registry.first_free_slot(), Some(0));
        registry.publish(listener_session(&registry, 0));
        registry.publish(listener_session(&registry, 1));
        assert_eq!(registry.first_free_slot(), Some(2));
        registry.retire(0);
        assert_eq!(registry.first_free_slot(), Some(0));
    }

    #[test]
    fn test_stale_id_rejected_after_slot_reuse() {
        let registry = SessionRegistry::new();
        let first = listener_session(&registry, 0);
        let first_id = first.id();
        registry.publish(first);
        registry.retire(0);
        registry.decrement_count();

        let second = listener_session(&registry, 0);
        let second_id = second.id();
        registry.publish(second);

        assert_ne!(first_id, second_id);
        assert!(!registry.contains(first_id));
        assert!(registry.contains(second_id));
        assert!(registry.lookup(first_id).is_none());
    }

    #[test]
    fn test_lookup_rejects_freed_unreused_slot() {
        let registry = SessionRegistry::new();
        let session = listener_session(&registry, 3);
        let id = session.id();
        registry.publish(session);
        registry.retire(3);
        assert!(registry.lookup(id).is_none());
    }

    #[test]
    fn test_live_sessions_snapshot_order() {
        let registry = SessionRegistry::new();
        registry.publish(listener_session(&registry, 2));
        registry.publish(listener_session(&registry, 0));
        let live = registry.live_sessions();
        assert_eq!(live.len(), 2);
        assert_eq!(live[0].slot_index(), 0);
        assert_eq!(live[1].slot_index(), 2);
    }
}
