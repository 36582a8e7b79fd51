//! Integration tests for configuration strings and startup behavior.
//!
//! These tests verify:
//! - Provider configuration strings drive real filtering decisions
//! - The empty configuration selects the default provider set
//! - Startup sessions from the builder and the environment, with `{pid}`
//!   expansion in output paths
//! - Streaming starts and disables deferred until background threads are
//!   permitted, and the transport-suspension escape hatch

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use tracemux::config::{ENV_BUFFER_MB, ENV_ENABLE, ENV_OUTPUT_PATH};
use tracemux::{
    CallbackRequest, EngineError, EventLevel, EventSink, MemorySink, ProviderConfig,
    SerializationFormat, SessionId, SessionOptions, SessionType, SinkFactory, SinkRecord,
    StartupSession, TraceEngine, RUNTIME_PROVIDER_NAME, SAMPLE_PROFILER_PROVIDER_NAME,
};

// ============================================================================
// Test Helpers
// ============================================================================

fn test_engine() -> TraceEngine {
    let engine = TraceEngine::builder().ignore_environment().build();
    engine.init();
    engine.finish_init();
    engine
}

fn listener_options(provider: &str) -> SessionOptions {
    SessionOptions::new(SessionType::Listener, SerializationFormat::NetTrace4)
        .with_providers(vec![ProviderConfig::new(
            provider,
            u64::MAX,
            EventLevel::Verbose,
        )])
}

/// Remembers every `create_sink` call together with the sink it produced.
#[derive(Default)]
struct CapturingFactory {
    calls: Mutex<Vec<(SessionType, Option<PathBuf>, u32, Arc<MemorySink>)>>,
}

impl CapturingFactory {
    fn captured(&self) -> Vec<(SessionType, Option<PathBuf>, u32, Arc<MemorySink>)> {
        self.calls.lock().clone()
    }
}

impl SinkFactory for CapturingFactory {
    fn create_sink(
        &self,
        session_type: SessionType,
        output_path: Option<&Path>,
        buffer_size_mb: u32,
    ) -> Result<Arc<dyn EventSink>, EngineError> {
        let sink = Arc::new(MemorySink::new());
        self.calls.lock().push((
            session_type,
            output_path.map(Path::to_path_buf),
            buffer_size_mb,
            Arc::clone(&sink),
        ));
        Ok(sink)
    }
}

// ============================================================================
// Configuration Strings
// ============================================================================

#[test]
fn test_config_string_controls_enablement() {
    let engine = test_engine();
    let provider = engine.create_provider("ProvA", None).unwrap();
    let hot = provider.add_event(1, 0, 0x30, EventLevel::Warning);
    let cold_keyword = provider.add_event(2, 0, 0x0F, EventLevel::Warning);
    let cold_level = provider.add_event(3, 0, 0x30, EventLevel::Informational);

    let id = engine
        .enable_from_config(
            "ProvA:0xF0:3",
            SessionType::Listener,
            SerializationFormat::NetTrace4,
            None,
            4,
            0,
            None,
        )
        .unwrap();

    // Keywords 0xF0 at level 3 (warning) admit only the first event.
    assert!(hot.is_enabled());
    assert!(!cold_keyword.is_enabled());
    assert!(!cold_level.is_enabled());

    engine.write_event(&hot, b"", None, None);
    engine.write_event(&cold_keyword, b"", None, None);
    engine.write_event(&cold_level, b"", None, None);
    assert_eq!(engine.get_next_event(id).unwrap().event_id, 1);
    assert!(engine.get_next_event(id).is_none());

    engine.disable(id);
}

#[test]
fn test_malformed_config_rejected() {
    let engine = test_engine();
    let result = engine.enable_from_config(
        "Prov,,Other",
        SessionType::Listener,
        SerializationFormat::NetTrace4,
        None,
        4,
        0,
        None,
    );
    assert!(matches!(
        result,
        Err(EngineError::InvalidProviderConfig { .. })
    ));
    assert_eq!(engine.session_count(), 0);
}

#[test]
fn test_file_session_from_config_needs_output_path() {
    let engine = test_engine();
    let result = engine.enable_from_config(
        "Prov",
        SessionType::File,
        SerializationFormat::NetTrace4,
        None,
        4,
        0,
        None,
    );
    assert!(matches!(
        result,
        Err(EngineError::InvalidOptions("missing output path"))
    ));
    assert_eq!(engine.session_count(), 0);
}

#[test]
fn test_empty_config_selects_default_providers() {
    let engine = test_engine();
    let id = engine
        .enable_from_config(
            "",
            SessionType::Listener,
            SerializationFormat::NetTrace4,
            None,
            4,
            0,
            None,
        )
        .unwrap();

    // The default set includes the sample profiler, which arms on enable.
    assert!(engine.is_sampling_armed());
    assert!(engine.get_provider(SAMPLE_PROFILER_PROVIDER_NAME).is_some());
    // The runtime provider is a dormant name until something registers it.
    assert!(engine.get_provider(RUNTIME_PROVIDER_NAME).is_none());

    engine.disable(id);
    assert!(!engine.is_sampling_armed());
}

// ============================================================================
// Startup Sessions
// ============================================================================

#[test]
fn test_startup_session_expands_pid_template() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(CapturingFactory::default());
    let engine = TraceEngine::builder()
        .sink_factory(factory.clone())
        .startup_session(StartupSession {
            config: Some("Boot:0xFF:5".to_string()),
            output_path: dir.path().join("boot_{pid}.nettrace").display().to_string(),
            buffer_size_mb: 32,
            streaming: false,
        })
        .build();
    engine.init();
    engine.finish_init();

    assert_eq!(engine.session_count(), 1);
    let calls = factory.captured();
    assert_eq!(calls.len(), 1);
    let (session_type, path, buffer_mb, _sink) = &calls[0];
    assert_eq!(*session_type, SessionType::File);
    assert_eq!(*buffer_mb, 32);
    let name = path
        .as_ref()
        .unwrap()
        .file_name()
        .unwrap()
        .to_string_lossy()
        .into_owned();
    assert_eq!(name, format!("boot_{}.nettrace", std::process::id()));
}

#[test]
fn test_bad_startup_config_is_skipped() {
    let factory = Arc::new(CapturingFactory::default());
    let engine = TraceEngine::builder()
        .sink_factory(factory.clone())
        .startup_session(StartupSession {
            config: Some(",broken".to_string()),
            ..StartupSession::default()
        })
        .build();
    engine.init();
    engine.finish_init();

    // The engine comes up without the session rather than failing init.
    assert_eq!(engine.session_count(), 0);
    assert!(factory.captured().is_empty());
}

#[test]
fn test_environment_startup_session() {
    let dir = tempfile::tempdir().unwrap();
    let template = dir.path().join("env_{pid}.nettrace");
    std::env::set_var(ENV_ENABLE, "1");
    std::env::set_var(ENV_OUTPUT_PATH, template.to_str().unwrap());
    std::env::set_var(ENV_BUFFER_MB, "8");

    let factory = Arc::new(CapturingFactory::default());
    let engine = TraceEngine::builder().sink_factory(factory.clone()).build();
    engine.init();

    std::env::remove_var(ENV_ENABLE);
    std::env::remove_var(ENV_OUTPUT_PATH);
    std::env::remove_var(ENV_BUFFER_MB);

    engine.finish_init();
    assert_eq!(engine.session_count(), 1);

    let calls = factory.captured();
    assert_eq!(calls.len(), 1);
    let (session_type, path, buffer_mb, _sink) = &calls[0];
    assert_eq!(*session_type, SessionType::File);
    assert_eq!(*buffer_mb, 8);
    let name = path
        .as_ref()
        .unwrap()
        .file_name()
        .unwrap()
        .to_string_lossy()
        .into_owned();
    assert!(name.starts_with("env_"));
    assert!(!name.contains("{pid}"));
    assert!(name.contains(&std::process::id().to_string()));
}

// ============================================================================
// Deferred Startup Work
// ============================================================================

#[test]
fn test_streaming_startup_waits_for_finish_init() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(CapturingFactory::default());
    let engine = TraceEngine::builder()
        .sink_factory(factory.clone())
        .startup_session(StartupSession {
            config: None,
            output_path: dir.path().join("stream.nettrace").display().to_string(),
            buffer_size_mb: 4,
            streaming: true,
        })
        .build();
    engine.init();

    let calls = factory.captured();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, SessionType::FileStream);
    // The streaming transition waits for background threads.
    let sink = &calls[0].3;
    assert!(!sink
        .records()
        .iter()
        .any(|r| matches!(r, SinkRecord::StreamingStarted)));

    engine.finish_init();
    assert!(sink
        .records()
        .iter()
        .any(|r| matches!(r, SinkRecord::StreamingStarted)));
}

#[test]
fn test_start_streaming_reaches_sink_once() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(CapturingFactory::default());
    let engine = TraceEngine::builder()
        .ignore_environment()
        .sink_factory(factory.clone())
        .build();
    engine.init();
    engine.finish_init();

    let options = SessionOptions::new(SessionType::FileStream, SerializationFormat::NetTrace4)
        .with_output_path(dir.path().join("once.nettrace"))
        .with_providers(vec![ProviderConfig::new("S", u64::MAX, EventLevel::Verbose)]);
    let id = engine.enable(&options).unwrap();

    engine.start_streaming(id);
    engine.start_streaming(id);

    let sink = &factory.captured()[0].3;
    let starts = sink
        .records()
        .iter()
        .filter(|r| matches!(r, SinkRecord::StreamingStarted))
        .count();
    assert_eq!(starts, 1);

    // A stale id is ignored.
    let bogus = SessionId::from_u64((77 << 8) | 5).unwrap();
    engine.start_streaming(bogus);

    engine.disable(id);
}

#[test]
fn test_disable_deferred_until_finish_init() {
    let engine = TraceEngine::builder().ignore_environment().build();
    engine.init();
    let id = engine.enable(&listener_options("Cfg")).unwrap();

    engine.disable(id);
    // Still live: the disable waits for background threads to be permitted.
    assert!(engine.is_session_enabled(id));
    assert_eq!(engine.session_count(), 1);

    engine.finish_init();
    assert!(!engine.is_session_enabled(id));
    assert_eq!(engine.session_count(), 0);
}

#[test]
fn test_deferred_disables_replay_in_request_order() {
    let engine = TraceEngine::builder().ignore_environment().build();
    engine.init();

    let order: Arc<Mutex<Vec<SessionId>>> = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&order);
    engine
        .create_provider(
            "Cfg",
            Some(Arc::new(move |request: &CallbackRequest| {
                if !request.enabled {
                    log.lock().push(request.session_id);
                }
            })),
        )
        .unwrap();

    let first = engine.enable(&listener_options("Cfg")).unwrap();
    let second = engine.enable(&listener_options("Cfg")).unwrap();

    engine.disable(first);
    engine.disable(second);
    // Both sessions stay live until background threads are permitted.
    assert_eq!(engine.session_count(), 2);
    assert!(order.lock().is_empty());

    engine.finish_init();
    assert_eq!(engine.session_count(), 0);
    // The queued disables replayed in the order they were requested.
    assert_eq!(order.lock().as_slice(), &[first, second]);
}

#[test]
fn test_suspended_transport_disables_inline() {
    let engine = TraceEngine::builder()
        .ignore_environment()
        .transport_suspended(|| true)
        .build();
    engine.init();
    let id = engine.enable(&listener_options("Cfg")).unwrap();

    // A suspended transport cannot wait for the deferred queue to replay.
    engine.disable(id);
    assert!(!engine.is_session_enabled(id));
    assert_eq!(engine.session_count(), 0);

    engine.finish_init();
    assert_eq!(engine.session_count(), 0);
}
