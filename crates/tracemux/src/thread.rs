//! Per-thread write tracking.
//!
//! Every thread that dispatches events owns a [`ThreadContext`] holding one
//! write-in-progress marker per session slot. The marker is the writer half of
//! the teardown handshake:
//!
//! * a writer sets its marker, then loads the slot pointer and writes;
//! * a disable clears the slot pointer, then spins until no thread's marker
//!   for that slot is set.
//!
//! The `SeqCst` fences on both sides rule out the interleaving where the
//! writer still sees the old pointer while the disabler already sees a clear
//! marker. Termination of the spin is guaranteed because the `allow_write` bit
//! is cleared before the pointer, so writers stop setting the marker for a
//! retiring slot.

use std::cell::RefCell;
use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::types::{SessionId, MAX_SESSIONS};

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

/// State the engine keeps for one dispatching thread.
pub(crate) struct ThreadContext {
    /// Engine-assigned id attributed to events this thread writes.
    thread_id: u64,
    /// Marker `i` is set while this thread is writing into session slot `i`.
    write_in_progress: [AtomicBool; MAX_SESSIONS],
    /// Raw id of the session this thread is running rundown for; zero when
    /// none. Written and read only by the owning thread.
    rundown_session: AtomicU64,
    activity_id: Mutex<Option<Uuid>>,
}

impl ThreadContext {
    fn new() -> Self {
        ThreadContext {
            thread_id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
            write_in_progress: std::array::from_fn(|_| AtomicBool::new(false)),
            rundown_session: AtomicU64::new(0),
            activity_id: Mutex::new(None),
        }
    }

    pub(crate) fn thread_id(&self) -> u64 {
        self.thread_id
    }

    /// Marks this thread as writing into `slot`. The fence orders the marker
    /// store before the subsequent slot-pointer load.
    #[inline(always)]
    pub(crate) fn begin_write(&self, slot: usize) {
        self.write_in_progress[slot].store(true, Ordering::SeqCst);
        fence(Ordering::SeqCst);
    }

    /// Clears the marker once the write has landed in the sink.
    #[inline(always)]
    pub(crate) fn end_write(&self, slot: usize) {
        self.write_in_progress[slot].store(false, Ordering::Release);
    }

    pub(crate) fn is_writing_to(&self, slot: usize) -> bool {
        self.write_in_progress[slot].load(Ordering::SeqCst)
    }

    pub(crate) fn set_rundown_session(&self, session: Option<SessionId>) {
        let raw = session.map_or(0, SessionId::as_u64);
        self.rundown_session.store(raw, Ordering::Relaxed);
    }

    pub(crate) fn rundown_session(&self) -> Option<SessionId> {
        SessionId::from_u64(self.rundown_session.load(Ordering::Relaxed))
    }

    pub(crate) fn activity_id(&self) -> Option<Uuid> {
        *self.activity_id.lock()
    }

    pub(crate) fn set_activity_id(&self, activity_id: Option<Uuid>) {
        *self.activity_id.lock() = activity_id;
    }

    /// Returns the thread's activity id, minting one on first use.
    pub(crate) fn get_or_create_activity_id(&self) -> Uuid {
        let mut guard = self.activity_id.lock();
        *guard.get_or_insert_with(Uuid::new_v4)
    }
}

/// All thread contexts known to one engine.
pub(crate) struct ThreadRegistry {
    contexts: Mutex<Vec<Arc<ThreadContext>>>,
}

impl ThreadRegistry {
    pub(crate) fn new() -> Self {
        ThreadRegistry {
            contexts: Mutex::new(Vec::new()),
        }
    }

    fn register(&self, context: Arc<ThreadContext>) {
        self.contexts.lock().push(context);
    }

    fn unregister(&self, context: &Arc<ThreadContext>) {
        self.contexts
            .lock()
            .retain(|c| !Arc::ptr_eq(c, context));
    }

    /// Spins until no registered thread is writing into `slot`. Called with
    /// the slot already unpublished, so new writers cannot appear.
    pub(crate) fn wait_for_slot_quiescence(&self, slot: usize) {
        fence(Ordering::SeqCst);
        loop {
            let busy = self
                .contexts
                .lock()
                .iter()
                .any(|c| c.is_writing_to(slot));
            if !busy {
                break;
            }
            std::thread::yield_now();
        }
    }
}

/// One engine's context on one thread, unregistered when the thread exits.
struct TlsSlot {
    engine_id: u64,
    registry: Weak<ThreadRegistry>,
    context: Arc<ThreadContext>,
}

impl Drop for TlsSlot {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(&self.context);
        }
    }
}

thread_local! {
    static THREAD_CONTEXTS: RefCell<Vec<TlsSlot>> = RefCell::new(Vec::new());
}

/// The calling thread's context for the given engine, created and registered
/// on first use. Returns `None` during thread teardown, once thread-local
/// storage is gone; callers treat that as "do not write".
pub(crate) fn current_thread_context(
    engine_id: u64,
    registry: &Arc<ThreadRegistry>,
) -> Option<Arc<ThreadContext>> {
    THREAD_CONTEXTS
        .try_with(|slots| {
            let mut slots = slots.borrow_mut();
            if let Some(slot) = slots.iter().find(|s| s.engine_id == engine_id) {
                return Arc::clone(&slot.context);
            }
            let context = Arc::new(ThreadContext::new());
            registry.register(Arc::clone(&context));
            slots.push(TlsSlot {
                engine_id,
                registry: Arc::downgrade(registry),
                context: Arc::clone(&context),
            });
            context
        })
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_write_markers() {
        let ctx = ThreadContext::new();
        assert!(!ctx.is_writing_to(0));
        ctx.begin_write(0);
        assert!(ctx.is_writing_to(0));
        assert!(!ctx.is_writing_to(1));
        ctx.end_write(0);
        assert!(!ctx.is_writing_to(0));
    }

    #[test]
    fn test_rundown_marker_roundtrip() {
        let ctx = ThreadContext::new();
        assert_eq!(ctx.rundown_session(), None);
        let id = SessionId::from_parts(3, 7);
        ctx.set_rundown_session(Some(id));
        assert_eq!(ctx.rundown_session(), Some(id));
        ctx.set_rundown_session(None);
        assert_eq!(ctx.rundown_session(), None);
    }

    #[test]
    fn test_activity_id_minted_once() {
        let ctx = ThreadContext::new();
        assert_eq!(ctx.activity_id(), None);
        let first = ctx.get_or_create_activity_id();
        assert_eq!(ctx.get_or_create_activity_id(), first);
        assert_eq!(ctx.activity_id(), Some(first));
        ctx.set_activity_id(None);
        assert_eq!(ctx.activity_id(), None);
    }

    #[test]
    fn test_quiescence_waits_for_marker() {
        let registry = Arc::new(ThreadRegistry::new());
        let ctx = current_thread_context(1, &registry).unwrap();
        ctx.begin_write(4);

        let waiter_registry = Arc::clone(&registry);
        let waiter = thread::spawn(move || {
            waiter_registry.wait_for_slot_quiescence(4);
        });

        // The waiter must still be spinning while the marker is set.
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        ctx.end_write(4);
        waiter.join().unwrap();
    }

    #[test]
    fn test_context_reused_per_engine() {
        let registry = Arc::new(ThreadRegistry::new());
        let a = current_thread_context(10, &registry).unwrap();
        let b = current_thread_context(10, &registry).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let other = current_thread_context(11, &registry).unwrap();
        assert!(!Arc::ptr_eq(&a, &other));
        assert_eq!(registry.contexts.lock().len(), 2);
    }

    #[test]
    fn test_thread_exit_unregisters_context() {
        let registry = Arc::new(ThreadRegistry::new());
        let spawn_registry = Arc::clone(&registry);
        thread::spawn(move || {
            let ctx = current_thread_context(42, &spawn_registry).unwrap();
            assert_eq!(spawn_registry.contexts.lock().len(), 1);
            drop(ctx);
        })
        .join()
        .unwrap();
        assert_eq!(registry.contexts.lock().len(), 0);
    }
}
