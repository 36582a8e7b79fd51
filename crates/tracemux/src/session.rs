//! Session state and enable-time option validation.
//!
//! A [`Session`] is immutable configuration plus a sink. All lifecycle
//! decisions (publishing, rundown, teardown ordering) belong to the engine;
//! the session only carries state and forwards writes to its sink.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{ProviderConfig, RUNTIME_PROVIDER_NAME, RUNTIME_RUNDOWN_PROVIDER_NAME};
use crate::error::EngineError;
use crate::sampler::SAMPLE_PROFILER_PROVIDER_NAME;
use crate::sink::{EventInstance, EventRecord, EventSink};
use crate::types::{
    EventLevel, SerializationFormat, SessionId, SessionType, DEFAULT_BUFFER_SIZE_MB,
    DEFAULT_RUNDOWN_KEYWORD,
};

/// Everything a caller specifies when enabling a session.
pub struct SessionOptions {
    /// Delivery model for the session.
    pub session_type: SessionType,
    /// Serialization format recorded as session metadata for the sink.
    pub format: SerializationFormat,
    /// Output path, required for file-backed session types.
    pub output_path: Option<PathBuf>,
    /// Buffer budget in megabytes.
    pub buffer_size_mb: u32,
    /// Providers the session wants, with their keyword masks and levels.
    pub providers: Vec<ProviderConfig>,
    /// Keyword mask for the rundown pass at disable time; zero skips rundown.
    pub rundown_keyword: u64,
    /// Caller-supplied sink for `IpcStream` sessions.
    pub stream: Option<Arc<dyn EventSink>>,
    /// Kernel tracing descriptor for `UserEvents` sessions.
    pub user_events_fd: Option<i32>,
}

impl SessionOptions {
    pub fn new(session_type: SessionType, format: SerializationFormat) -> Self {
        SessionOptions {
            session_type,
            format,
            output_path: None,
            buffer_size_mb: DEFAULT_BUFFER_SIZE_MB,
            providers: Vec::new(),
            rundown_keyword: DEFAULT_RUNDOWN_KEYWORD,
            stream: None,
            user_events_fd: None,
        }
    }

    pub fn with_output_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = Some(path.into());
        self
    }

    pub fn with_buffer_size_mb(mut self, megabytes: u32) -> Self {
        self.buffer_size_mb = megabytes;
        self
    }

    pub fn with_providers(mut self, providers: Vec<ProviderConfig>) -> Self {
        self.providers = providers;
        self
    }

    pub fn with_rundown_keyword(mut self, keyword: u64) -> Self {
        self.rundown_keyword = keyword;
        self
    }

    pub fn with_stream(mut self, stream: Arc<dyn EventSink>) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn with_user_events_fd(mut self, fd: i32) -> Self {
        self.user_events_fd = Some(fd);
        self
    }

    /// Checks the options before any slot or sink resources are claimed, so a
    /// failed enable leaves no trace behind.
    pub(crate) fn validate(&self) -> Result<(), EngineError> {
        if self.providers.is_empty() {
            return Err(EngineError::InvalidOptions("no providers requested"));
        }
        if self.providers.iter().any(|p| p.name.is_empty()) {
            return Err(EngineError::InvalidOptions("empty provider name"));
        }
        if self.session_type.uses_buffer_manager() && self.buffer_size_mb == 0 {
            return Err(EngineError::InvalidOptions("buffer size must be positive"));
        }
        if self.session_type.writes_to_file()
            && self.output_path.as_deref().map_or(true, |p| p.as_os_str().is_empty())
        {
            return Err(EngineError::InvalidOptions("missing output path"));
        }
        if self.session_type == SessionType::IpcStream && self.stream.is_none() {
            return Err(EngineError::InvalidOptions("missing ipc stream"));
        }
        if self.session_type == SessionType::UserEvents
            && self.user_events_fd.map_or(true, |fd| fd < 0)
        {
            return Err(EngineError::InvalidOptions(
                "missing user-events descriptor",
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("session_type", &self.session_type)
            .field("format", &self.format)
            .field("output_path", &self.output_path)
            .field("buffer_size_mb", &self.buffer_size_mb)
            .field("providers", &self.providers)
            .field("rundown_keyword", &self.rundown_keyword)
            .field("has_stream", &self.stream.is_some())
            .field("user_events_fd", &self.user_events_fd)
            .finish()
    }
}

/// The provider entries installed as a session's filter list for its rundown
/// pass: the public runtime provider and the dedicated rundown provider, both
/// at the session's rundown keyword.
pub(crate) fn rundown_provider_configs(rundown_keyword: u64) -> Vec<ProviderConfig> {
    vec![
        ProviderConfig::new(RUNTIME_PROVIDER_NAME, rundown_keyword, EventLevel::Verbose),
        ProviderConfig::new(
            RUNTIME_RUNDOWN_PROVIDER_NAME,
            rundown_keyword,
            EventLevel::Verbose,
        ),
    ]
}

/// One enabled tracing session.
pub struct Session {
    id: SessionId,
    slot_index: usize,
    session_type: SessionType,
    format: SerializationFormat,
    rundown_keyword: u64,
    buffer_size_mb: u32,
    output_path: Option<PathBuf>,
    user_events_fd: Option<i32>,
    /// Filter list; swapped for the rundown providers at disable time.
    providers: Mutex<Vec<ProviderConfig>>,
    rundown_enabled: AtomicBool,
    streaming_started: AtomicBool,
    sink: Arc<dyn EventSink>,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        slot_index: usize,
        options: &SessionOptions,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Session {
            id,
            slot_index,
            session_type: options.session_type,
            format: options.format,
            rundown_keyword: options.rundown_keyword,
            buffer_size_mb: options.buffer_size_mb,
            output_path: options.output_path.clone(),
            user_events_fd: options.user_events_fd,
            providers: Mutex::new(options.providers.clone()),
            rundown_enabled: AtomicBool::new(false),
            streaming_started: AtomicBool::new(false),
            sink,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn slot_index(&self) -> usize {
        self.slot_index
    }

    pub fn session_type(&self) -> SessionType {
        self.session_type
    }

    pub fn format(&self) -> SerializationFormat {
        self.format
    }

    pub fn rundown_keyword(&self) -> u64 {
        self.rundown_keyword
    }

    pub fn buffer_size_mb(&self) -> u32 {
        self.buffer_size_mb
    }

    pub fn output_path(&self) -> Option<&Path> {
        self.output_path.as_deref()
    }

    pub fn user_events_fd(&self) -> Option<i32> {
        self.user_events_fd
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming_started.load(Ordering::Acquire)
    }

    pub(crate) fn is_rundown_enabled(&self) -> bool {
        self.rundown_enabled.load(Ordering::Acquire)
    }

    pub(crate) fn provider_configs(&self) -> Vec<ProviderConfig> {
        self.providers.lock().clone()
    }

    pub(crate) fn add_provider_config(&self, config: ProviderConfig) {
        self.providers.lock().push(config);
    }

    /// Whether the session asked for the sample profiler. Consulted before
    /// the rundown pass replaces the filter list, so the answer reflects what
    /// the caller originally requested.
    pub(crate) fn requested_sampling(&self) -> bool {
        self.providers
            .lock()
            .iter()
            .any(|p| p.name == SAMPLE_PROFILER_PROVIDER_NAME)
    }

    /// Swaps the filter list for the rundown providers. The session's own
    /// filters were already deactivated by this point; only the snapshot
    /// events of the rundown pass flow through the replacement list.
    pub(crate) fn enable_rundown(&self) {
        let mut providers = self.providers.lock();
        *providers = rundown_provider_configs(self.rundown_keyword);
        self.rundown_enabled.store(true, Ordering::Release);
    }

    /// Transitions to streaming delivery. Only the first call reaches the
    /// sink.
    pub(crate) fn start_streaming(&self) {
        if self
            .streaming_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.sink.start_streaming();
        }
    }

    #[inline(always)]
    pub(crate) fn write(&self, record: &EventRecord<'_>) -> bool {
        self.sink.write(record)
    }

    pub(crate) fn flush(&self) {
        self.sink.flush();
    }

    pub(crate) fn write_sequence_point(&self) {
        self.sink.write_sequence_point();
    }

    pub(crate) fn next_event(&self) -> Option<EventInstance> {
        self.sink.next_event()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("slot_index", &self.slot_index)
            .field("session_type", &self.session_type)
            .field("format", &self.format)
            .field("rundown_keyword", &self.rundown_keyword)
            .finish()
    }
}
