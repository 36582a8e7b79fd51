//! Multi-session event tracing engine with a lock-free write path.
//!
//! `tracemux` lets a process define typed events under named providers and
//! fan each one out to up to 64 concurrent tracing sessions, every session
//! with its own keyword and level filters and its own delivery sink:
//! - Providers and events with per-session enablement cached as atomic masks
//! - File, streaming, in-process listener and user-events session types
//! - Provider configuration strings and environment-driven startup sessions
//! - Rundown passes that replay recorded checkpoints into a closing session
//! - A sample-profiler arm/disarm gate for an embedder's sampling thread
//!
//! The write path takes no locks: enablement is one atomic load on the event,
//! and session teardown coordinates with in-flight writers through per-thread
//! write markers instead of blocking them.

pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod event_source;
pub mod provider;
pub mod sampler;
pub mod session;
pub mod sink;
pub mod types;

mod callback;
mod deferred;
mod dispatch;
mod registry;
mod thread;

pub use callback::{CallbackRequest, ProviderCallback};
pub use checkpoint::ExecutionCheckpoint;
pub use config::{
    default_provider_configs, parse_provider_config, ProviderConfig, StartupSession,
    RUNTIME_PRIVATE_PROVIDER_NAME, RUNTIME_PROVIDER_NAME, RUNTIME_RUNDOWN_PROVIDER_NAME,
};
pub use engine::{TraceEngine, TraceEngineBuilder, TransportSuspendedFn};
pub use error::EngineError;
pub use event_source::ENGINE_PROVIDER_NAME;
pub use provider::{Provider, TraceEvent};
pub use sampler::{DEFAULT_SAMPLING_RATE_NS, SAMPLE_PROFILER_PROVIDER_NAME};
pub use session::{Session, SessionOptions};
pub use sink::{
    DefaultSinkFactory, EventInstance, EventRecord, EventSink, ListenerSink, MemorySink,
    NullSink, SinkFactory, SinkRecord,
};
pub use types::{
    EngineState, EventLevel, SerializationFormat, SessionId, SessionType, Timestamp,
    MAX_SESSIONS,
};
