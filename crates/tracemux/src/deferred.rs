//! Deferral of work that needs background threads.
//!
//! Early in process startup the embedder may not be able to run threads yet
//! (signal handlers not installed, runtime services half up). Until it calls
//! [`finish_init`](crate::engine::TraceEngine::finish_init), session streaming
//! starts and session disables are queued here instead of executed. The
//! transition replays both queues in FIFO order, exactly once: enables first,
//! then disables.

use std::collections::VecDeque;

use crate::types::SessionId;

pub(crate) struct DeferredQueues {
    /// Latched true by the first replay; never goes back.
    threads_permitted: bool,
    pending_streaming: VecDeque<SessionId>,
    pending_disable: VecDeque<SessionId>,
}

impl DeferredQueues {
    pub(crate) fn new() -> Self {
        DeferredQueues {
            threads_permitted: false,
            pending_streaming: VecDeque::new(),
            pending_disable: VecDeque::new(),
        }
    }

    pub(crate) fn threads_permitted(&self) -> bool {
        self.threads_permitted
    }

    /// Queues a streaming start. Returns `false` when the transition has
    /// already happened and the caller should start streaming inline.
    pub(crate) fn defer_streaming_start(&mut self, id: SessionId) -> bool {
        if self.threads_permitted {
            return false;
        }
        self.pending_streaming.push_back(id);
        true
    }

    /// Queues a disable. Returns `false` when the transition has already
    /// happened and the caller should disable inline.
    pub(crate) fn defer_disable(&mut self, id: SessionId) -> bool {
        if self.threads_permitted {
            return false;
        }
        self.pending_disable.push_back(id);
        true
    }

    /// Latches the transition and hands back both queues. The second and
    /// every later call returns empty queues.
    pub(crate) fn begin_replay(&mut self) -> (Vec<SessionId>, Vec<SessionId>) {
        self.threads_permitted = true;
        (
            self.pending_streaming.drain(..).collect(),
            self.pending_disable.drain(..).collect(),
        )
    }

    pub(crate) fn clear(&mut self) {
        self.pending_streaming.clear();
        self.pending_disable.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> SessionId {
        SessionId::from_parts(n, 0)
    }

    #[test]
    fn test_replay_preserves_fifo_order() {
        let mut queues = DeferredQueues::new();
        assert!(queues.defer_streaming_start(id(1)));
        assert!(queues.defer_streaming_start(id(2)));
        assert!(queues.defer_disable(id(3)));
        let (streaming, disables) = queues.begin_replay();
        assert_eq!(streaming, vec![id(1), id(2)]);
        assert_eq!(disables, vec![id(3)]);
    }

    #[test]
    fn test_replay_happens_once() {
        let mut queues = DeferredQueues::new();
        queues.defer_streaming_start(id(1));
        let (first, _) = queues.begin_replay();
        assert_eq!(first.len(), 1);
        let (second, disables) = queues.begin_replay();
        assert!(second.is_empty());
        assert!(disables.is_empty());
    }

    #[test]
    fn test_no_deferral_after_transition() {
        let mut queues = DeferredQueues::new();
        queues.begin_replay();
        assert!(queues.threads_permitted());
        assert!(!queues.defer_streaming_start(id(1)));
        assert!(!queues.defer_disable(id(2)));
        let (streaming, disables) = queues.begin_replay();
        assert!(streaming.is_empty());
        assert!(disables.is_empty());
    }
}
