//! Provider callback queueing.
//!
//! Provider callbacks are user code and must never run under the engine's
//! configuration lock. Mutating operations record every notification they owe
//! in a [`CallbackQueue`] while holding the lock, release the lock, then drain
//! the queue. Each queued entry bumps the owning provider's pending counter so
//! that [`delete_provider`](crate::engine::TraceEngine::delete_provider) can
//! wait for in-flight invocations before the provider is torn down.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::error;

use crate::types::{EventLevel, SessionId};

/// Callback invoked when a provider's enablement changes for some session.
pub type ProviderCallback = Arc<dyn Fn(&CallbackRequest) + Send + Sync>;

/// Arguments delivered to a [`ProviderCallback`].
#[derive(Debug, Clone)]
pub struct CallbackRequest {
    /// Session whose filter for this provider changed.
    pub session_id: SessionId,
    /// `true` when the provider was just enabled for the session.
    pub enabled: bool,
    /// Keyword mask the session requested.
    pub keywords: u64,
    /// Level the session requested.
    pub level: EventLevel,
    /// Opaque argument string from the session's provider configuration.
    pub filter_data: Option<String>,
}

/// Counter of callback invocations that have been queued but not yet finished.
pub(crate) struct PendingCallbacks {
    count: Mutex<usize>,
    done: Condvar,
}

impl PendingCallbacks {
    pub(crate) fn new() -> Self {
        PendingCallbacks {
            count: Mutex::new(0),
            done: Condvar::new(),
        }
    }

    fn begin(&self) {
        *self.count.lock() += 1;
    }

    fn finish(&self) {
        let mut count = self.count.lock();
        debug_assert!(*count > 0, "callback finished that was never queued");
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.done.notify_all();
        }
    }

    pub(crate) fn pending(&self) -> usize {
        *self.count.lock()
    }

    /// Blocks until every queued invocation has finished. Must not be called
    /// while holding the engine's configuration lock.
    pub(crate) fn wait_zero(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.done.wait(&mut count);
        }
    }
}

struct QueuedCallback {
    pending: Arc<PendingCallbacks>,
    callback: ProviderCallback,
    request: CallbackRequest,
}

/// FIFO of notifications accumulated under the configuration lock.
pub(crate) struct CallbackQueue {
    items: VecDeque<QueuedCallback>,
}

impl CallbackQueue {
    pub(crate) fn new() -> Self {
        CallbackQueue {
            items: VecDeque::new(),
        }
    }

    /// Records one owed invocation and bumps the provider's pending counter.
    /// Callers hold the configuration lock here.
    pub(crate) fn push(
        &mut self,
        pending: Arc<PendingCallbacks>,
        callback: ProviderCallback,
        request: CallbackRequest,
    ) {
        pending.begin();
        self.items.push_back(QueuedCallback {
            pending,
            callback,
            request,
        });
    }

    /// Invokes every queued callback in FIFO order. A panicking callback is
    /// contained and logged; the remaining queue still runs and the pending
    /// counters still reach zero. Callers must have released the
    /// configuration lock.
    pub(crate) fn drain(mut self) {
        while let Some(item) = self.items.pop_front() {
            let result = catch_unwind(AssertUnwindSafe(|| (item.callback)(&item.request)));
            if result.is_err() {
                error!(
                    session_id = %item.request.session_id,
                    enabled = item.request.enabled,
                    "provider callback panicked"
                );
            }
            item.pending.finish();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionId;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn request(enabled: bool) -> CallbackRequest {
        CallbackRequest {
            session_id: SessionId::from_parts(1, 0),
            enabled,
            keywords: 0xff,
            level: EventLevel::Verbose,
            filter_data: None,
        }
    }

    #[test]
    fn test_drain_runs_in_fifo_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let pending = Arc::new(PendingCallbacks::new());
        let mut queue = CallbackQueue::new();
        for tag in 0..3usize {
            let order = Arc::clone(&order);
            queue.push(
                Arc::clone(&pending),
                Arc::new(move |_req| order.lock().push(tag)),
                request(true),
            );
        }
        assert_eq!(pending.pending(), 3);
        queue.drain();
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert_eq!(pending.pending(), 0);
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let invoked = Arc::new(AtomicUsize::new(0));
        let pending = Arc::new(PendingCallbacks::new());
        let mut queue = CallbackQueue::new();
        queue.push(
            Arc::clone(&pending),
            Arc::new(|_req| panic!("callback boom")),
            request(true),
        );
        let invoked_clone = Arc::clone(&invoked);
        queue.push(
            Arc::clone(&pending),
            Arc::new(move |_req| {
                invoked_clone.fetch_add(1, Ordering::SeqCst);
            }),
            request(false),
        );
        queue.drain();
        assert_eq!(invoked.load(Ordering::SeqCst), 1);
        assert_eq!(pending.pending(), 0);
    }

    #[test]
    fn test_wait_zero_blocks_until_drain() {
        let pending = Arc::new(PendingCallbacks::new());
        let mut queue = CallbackQueue::new();
        queue.push(Arc::clone(&pending), Arc::new(|_req| {}), request(true));

        let waiter_pending = Arc::clone(&pending);
        let waited = Arc::new(AtomicUsize::new(0));
        let waited_clone = Arc::clone(&waited);
        let waiter = thread::spawn(move || {
            waiter_pending.wait_zero();
            waited_clone.store(1, Ordering::SeqCst);
        });

        queue.drain();
        waiter.join().unwrap();
        assert_eq!(waited.load(Ordering::SeqCst), 1);
        assert_eq!(pending.pending(), 0);
    }
}
