//! Execution checkpoints replayed during rundown.
//!
//! Embedders label moments of interest (startup phases, mode switches) while
//! tracing runs. The labels are held process-wide and emitted into each
//! session's rundown pass, so a trace carries the checkpoints even when the
//! session started long after they were recorded.

use crate::types::Timestamp;

/// A named moment recorded for later rundown emission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionCheckpoint {
    /// Caller-chosen label.
    pub name: String,
    /// Caller-supplied timestamp, opaque to the engine.
    pub timestamp: Timestamp,
}

impl ExecutionCheckpoint {
    pub fn new(name: impl Into<String>, timestamp: Timestamp) -> Self {
        ExecutionCheckpoint {
            name: name.into(),
            timestamp,
        }
    }
}

/// Insertion-ordered list of checkpoints. Guarded by the engine's
/// configuration lock.
#[derive(Debug, Default)]
pub(crate) struct CheckpointList {
    items: Vec<ExecutionCheckpoint>,
}

impl CheckpointList {
    pub(crate) fn push(&mut self, checkpoint: ExecutionCheckpoint) {
        self.items.push(checkpoint);
    }

    /// Snapshot in insertion order, cloned so rundown can emit without
    /// holding a borrow on the list.
    pub(crate) fn snapshot(&self) -> Vec<ExecutionCheckpoint> {
        self.items.clone()
    }

    pub(crate) fn clear(&mut self) {
        self.items.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_preserves_insertion_order() {
        let mut list = CheckpointList::default();
        list.push(ExecutionCheckpoint::new("start", 100));
        list.push(ExecutionCheckpoint::new("mid", 200));
        list.push(ExecutionCheckpoint::new("end", 300));
        let snapshot = list.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[0], ExecutionCheckpoint::new("start", 100));
        assert_eq!(snapshot[1].name, "mid");
        assert_eq!(snapshot[2].timestamp, 300);
    }

    #[test]
    fn test_clear_empties_list() {
        let mut list = CheckpointList::default();
        list.push(ExecutionCheckpoint::new("start", 1));
        assert_eq!(list.len(), 1);
        list.clear();
        assert_eq!(list.len(), 0);
        assert!(list.snapshot().is_empty());
    }
}
