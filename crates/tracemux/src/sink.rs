//! Session writer seam.
//!
//! The engine core decides *which* sessions receive an event; an [`EventSink`]
//! decides what to do with it. The core never encodes a file format itself.
//! Embedders register a [`SinkFactory`] to attach real writers (trace files,
//! IPC transports, kernel descriptors); the built-in sinks cover the listener
//! pull model and tests.
//!
//! ## Performance Requirements
//!
//! [`EventSink::write`] is called from the lock-free dispatch path while a
//! disable elsewhere may be spin-waiting for the writing thread to finish.
//! Implementations must not block on I/O or take long-held locks.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::EngineError;
use crate::types::{EventLevel, SessionType};

/// Most events a [`ListenerSink`] buffers before dropping new arrivals.
pub const DEFAULT_LISTENER_CAPACITY: usize = 4096;

/// A fully resolved event as it crosses into a sink, borrowing the caller's
/// payload to keep the hot path allocation-free.
#[derive(Debug, Clone, Copy)]
pub struct EventRecord<'a> {
    /// Name of the provider that defined the event.
    pub provider_name: &'a str,
    /// Provider-scoped event identifier.
    pub event_id: u32,
    /// Event definition version.
    pub event_version: u32,
    /// Keyword bits declared on the event definition.
    pub keywords: u64,
    /// Level declared on the event definition.
    pub level: EventLevel,
    /// Raw payload bytes; the engine treats them as opaque.
    pub payload: &'a [u8],
    /// Activity the event belongs to, explicit or inherited from the thread.
    pub activity_id: Option<Uuid>,
    /// Activity that caused this one, when the caller supplied it.
    pub related_activity_id: Option<Uuid>,
    /// Thread the event is attributed to. For sample-profile events this is
    /// the sampled thread, not the sampler.
    pub thread_id: u64,
    /// Thread that physically performed the write.
    pub capture_thread_id: u64,
    /// Wall-clock capture time.
    pub timestamp: DateTime<Utc>,
}

/// Owned form of an [`EventRecord`], used wherever the event outlives the
/// write call (listener queues, tests).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventInstance {
    pub provider_name: String,
    pub event_id: u32,
    pub event_version: u32,
    pub keywords: u64,
    pub level: EventLevel,
    pub payload: Vec<u8>,
    pub activity_id: Option<Uuid>,
    pub related_activity_id: Option<Uuid>,
    pub thread_id: u64,
    pub capture_thread_id: u64,
    pub timestamp: DateTime<Utc>,
}

impl EventInstance {
    pub fn from_record(record: &EventRecord<'_>) -> Self {
        EventInstance {
            provider_name: record.provider_name.to_string(),
            event_id: record.event_id,
            event_version: record.event_version,
            keywords: record.keywords,
            level: record.level,
            payload: record.payload.to_vec(),
            activity_id: record.activity_id,
            related_activity_id: record.related_activity_id,
            thread_id: record.thread_id,
            capture_thread_id: record.capture_thread_id,
            timestamp: record.timestamp,
        }
    }
}

/// Destination for one session's events.
pub trait EventSink: Send + Sync {
    /// Delivers one event. Returns `false` when the event was dropped, for
    /// example because a bounded buffer is full.
    fn write(&self, record: &EventRecord<'_>) -> bool;

    /// Forces buffered events out to the underlying destination.
    fn flush(&self);

    /// Marks a point before which every accepted event has been made durable.
    /// The engine emits one final sequence point after a session quiesces.
    fn write_sequence_point(&self);

    /// Called once when the session transitions to streaming delivery.
    fn start_streaming(&self) {}

    /// Pops the oldest buffered event, for sinks that support in-process
    /// consumption. The default implementation buffers nothing.
    fn next_event(&self) -> Option<EventInstance> {
        None
    }
}

/// Creates sinks for newly enabled sessions.
///
/// The factory runs under the engine's configuration lock, before the session
/// becomes visible to writers; failures abort the enable with nothing
/// published.
pub trait SinkFactory: Send + Sync {
    fn create_sink(
        &self,
        session_type: SessionType,
        output_path: Option<&Path>,
        buffer_size_mb: u32,
    ) -> Result<Arc<dyn EventSink>, EngineError>;
}

/// Discards everything. Used for session types whose real writer lives in the
/// embedder when no factory has been registered.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn write(&self, _record: &EventRecord<'_>) -> bool {
        true
    }

    fn flush(&self) {}

    fn write_sequence_point(&self) {}
}

/// Bounded in-process queue backing `Listener` sessions.
///
/// New events are dropped once the queue is full; the consumer drains through
/// [`TraceEngine::get_next_event`](crate::engine::TraceEngine::get_next_event).
pub struct ListenerSink {
    queue: Mutex<VecDeque<EventInstance>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl ListenerSink {
    pub fn new(capacity: usize) -> Self {
        ListenerSink {
            queue: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Number of events dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Number of events currently buffered.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ListenerSink {
    fn default() -> Self {
        ListenerSink::new(DEFAULT_LISTENER_CAPACITY)
    }
}

impl EventSink for ListenerSink {
    fn write(&self, record: &EventRecord<'_>) -> bool {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        queue.push_back(EventInstance::from_record(record));
        true
    }

    fn flush(&self) {}

    fn write_sequence_point(&self) {}

    fn next_event(&self) -> Option<EventInstance> {
        self.queue.lock().pop_front()
    }
}

/// What a [`MemorySink`] observed, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkRecord {
    Event(EventInstance),
    Flush,
    SequencePoint,
    StreamingStarted,
}

/// Records every sink call for later inspection. Intended for tests and for
/// embedders validating their integration.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<SinkRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        MemorySink::default()
    }

    /// Everything observed so far, in order.
    pub fn records(&self) -> Vec<SinkRecord> {
        self.records.lock().clone()
    }

    /// Only the events, in arrival order.
    pub fn events(&self) -> Vec<EventInstance> {
        self.records
            .lock()
            .iter()
            .filter_map(|r| match r {
                SinkRecord::Event(e) => Some(e.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn event_count(&self) -> usize {
        self.records
            .lock()
            .iter()
            .filter(|r| matches!(r, SinkRecord::Event(_)))
            .count()
    }
}

impl EventSink for MemorySink {
    fn write(&self, record: &EventRecord<'_>) -> bool {
        self.records
            .lock()
            .push(SinkRecord::Event(EventInstance::from_record(record)));
        true
    }

    fn flush(&self) {
        self.records.lock().push(SinkRecord::Flush);
    }

    fn write_sequence_point(&self) {
        self.records.lock().push(SinkRecord::SequencePoint);
    }

    fn start_streaming(&self) {
        self.records.lock().push(SinkRecord::StreamingStarted);
    }
}

/// Factory used when the embedder registers nothing: listener sessions get a
/// [`ListenerSink`], everything else a [`NullSink`].
#[derive(Debug, Default)]
pub struct DefaultSinkFactory;

impl SinkFactory for DefaultSinkFactory {
    fn create_sink(
        &self,
        session_type: SessionType,
        _output_path: Option<&Path>,
        _buffer_size_mb: u32,
    ) -> Result<Arc<dyn EventSink>, EngineError> {
        match session_type {
            SessionType::Listener => Ok(Arc::new(ListenerSink::default())),
            _ => Ok(Arc::new(NullSink)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record<'a>(payload: &'a [u8]) -> EventRecord<'a> {
        EventRecord {
            provider_name: "TestProvider",
            event_id: 1,
            event_version: 0,
            keywords: 0,
            level: EventLevel::Informational,
            payload,
            activity_id: None,
            related_activity_id: None,
            thread_id: 1,
            capture_thread_id: 1,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_listener_sink_fifo() {
        let sink = ListenerSink::new(8);
        assert!(sink.write(&record(b"a")));
        assert!(sink.write(&record(b"b")));
        assert_eq!(sink.next_event().unwrap().payload, b"a");
        assert_eq!(sink.next_event().unwrap().payload, b"b");
        assert!(sink.next_event().is_none());
    }

    #[test]
    fn test_listener_sink_drops_when_full() {
        let sink = ListenerSink::new(2);
        assert!(sink.write(&record(b"a")));
        assert!(sink.write(&record(b"b")));
        assert!(!sink.write(&record(b"c")));
        assert_eq!(sink.dropped(), 1);
        assert_eq!(sink.len(), 2);
        // Draining one slot admits the next write again.
        sink.next_event();
        assert!(sink.write(&record(b"d")));
    }

    #[test]
    fn test_memory_sink_preserves_call_order() {
        let sink = MemorySink::new();
        sink.start_streaming();
        sink.write(&record(b"x"));
        sink.flush();
        sink.write_sequence_point();
        let records = sink.records();
        assert_eq!(records.len(), 4);
        assert_eq!(records[0], SinkRecord::StreamingStarted);
        assert!(matches!(records[1], SinkRecord::Event(_)));
        assert_eq!(records[2], SinkRecord::Flush);
        assert_eq!(records[3], SinkRecord::SequencePoint);
        assert_eq!(sink.event_count(), 1);
    }

    #[test]
    fn test_default_factory_sink_kinds() {
        let factory = DefaultSinkFactory;
        let listener = factory
            .create_sink(SessionType::Listener, None, 1)
            .unwrap();
        assert!(listener.next_event().is_none());
        listener.write(&record(b"a"));
        assert!(listener.next_event().is_some());

        let file = factory
            .create_sink(SessionType::File, Some(Path::new("out.bin")), 1)
            .unwrap();
        assert!(file.write(&record(b"a")));
        assert!(file.next_event().is_none());
    }
}
