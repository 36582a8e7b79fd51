//! The engine façade: lifecycle, session management, provider management.
//!
//! ## Architecture
//!
//! One `parking_lot` mutex (the configuration lock) serializes every mutating
//! operation: enable, disable, provider creation and deletion, streaming
//! starts, checkpoint recording. The write path in [`crate::dispatch`] never
//! takes it; it relies on the `allow_write` bitmask, per-event masks and the
//! per-thread write markers instead.
//!
//! Two rules keep the lock safe to hold:
//!
//! * provider callbacks are queued under the lock and invoked after release;
//! * waiting on pending callbacks happens outside the lock.
//!
//! Engines are instances, not process globals. Each carries its own slot
//! table, provider table and thread registry, so independent components (and
//! tests) can run engines side by side.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::callback::{CallbackQueue, CallbackRequest, ProviderCallback};
use crate::checkpoint::{CheckpointList, ExecutionCheckpoint};
use crate::config::{
    default_provider_configs, expand_pid_template, parse_provider_config,
    startup_session_from_env, ProviderConfig, StartupSession,
};
use crate::deferred::DeferredQueues;
use crate::dispatch;
use crate::error::EngineError;
use crate::event_source::EventSource;
use crate::provider::{Provider, ProviderInner, ProviderTable, SessionFilter, TraceEvent};
use crate::registry::SessionRegistry;
use crate::sampler::SampleProfiler;
use crate::session::{Session, SessionOptions};
use crate::sink::{DefaultSinkFactory, EventInstance, EventSink, SinkFactory};
use crate::thread::{current_thread_context, ThreadRegistry};
use crate::types::{
    EngineState, SerializationFormat, SessionId, SessionType, Timestamp,
    DEFAULT_RUNDOWN_KEYWORD,
};

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

/// Probe reporting whether the control transport is still suspended. While it
/// returns `true`, disables arriving before [`TraceEngine::finish_init`] run
/// inline instead of being deferred.
pub type TransportSuspendedFn = Box<dyn Fn() -> bool + Send>;

/// How the engine decides on its automatic startup session.
enum StartupPolicy {
    /// Read the `TRACEMUX_*` environment variables at `init`.
    Environment,
    /// Use this description, ignoring the environment.
    Explicit(StartupSession),
    /// Never open a startup session.
    Disabled,
}

/// State shared by every handle to one engine.
pub(crate) struct EngineShared {
    pub(crate) id: u64,
    state: AtomicU8,
    pub(crate) registry: SessionRegistry,
    pub(crate) threads: Arc<ThreadRegistry>,
    sampler: SampleProfiler,
    event_source: OnceCell<EventSource>,
    /// The configuration lock.
    core: Mutex<EngineCore>,
}

impl EngineShared {
    pub(crate) fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: EngineState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Everything guarded by the configuration lock.
struct EngineCore {
    providers: ProviderTable,
    deferred: DeferredQueues,
    checkpoints: CheckpointList,
    sink_factory: Arc<dyn SinkFactory>,
    transport_suspended: Option<TransportSuspendedFn>,
    startup: StartupPolicy,
}

/// Builds a [`TraceEngine`] with non-default wiring.
pub struct TraceEngineBuilder {
    sink_factory: Arc<dyn SinkFactory>,
    transport_suspended: Option<TransportSuspendedFn>,
    startup: StartupPolicy,
}

impl TraceEngineBuilder {
    fn new() -> Self {
        TraceEngineBuilder {
            sink_factory: Arc::new(DefaultSinkFactory),
            transport_suspended: None,
            startup: StartupPolicy::Environment,
        }
    }

    /// Registers the factory that produces writers for new sessions.
    pub fn sink_factory(mut self, factory: Arc<dyn SinkFactory>) -> Self {
        self.sink_factory = factory;
        self
    }

    /// Registers the transport-suspension probe consulted by early disables.
    pub fn transport_suspended(mut self, probe: impl Fn() -> bool + Send + 'static) -> Self {
        self.transport_suspended = Some(Box::new(probe));
        self
    }

    /// Opens this session at `init` instead of consulting the environment.
    pub fn startup_session(mut self, session: StartupSession) -> Self {
        self.startup = StartupPolicy::Explicit(session);
        self
    }

    /// Never opens a startup session, regardless of the environment.
    pub fn ignore_environment(mut self) -> Self {
        self.startup = StartupPolicy::Disabled;
        self
    }

    pub fn build(self) -> TraceEngine {
        TraceEngine {
            shared: Arc::new(EngineShared {
                id: NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed),
                state: AtomicU8::new(EngineState::NotInitialized as u8),
                registry: SessionRegistry::new(),
                threads: Arc::new(ThreadRegistry::new()),
                sampler: SampleProfiler::new(),
                event_source: OnceCell::new(),
                core: Mutex::new(EngineCore {
                    providers: ProviderTable::new(),
                    deferred: DeferredQueues::new(),
                    checkpoints: CheckpointList::default(),
                    sink_factory: self.sink_factory,
                    transport_suspended: self.transport_suspended,
                    startup: self.startup,
                }),
            }),
        }
    }
}

/// A multi-session event tracing engine.
///
/// Handles are cheap to clone and share one underlying engine.
#[derive(Clone)]
pub struct TraceEngine {
    shared: Arc<EngineShared>,
}

impl TraceEngine {
    /// An engine with default wiring: built-in sinks, startup session from
    /// the environment.
    pub fn new() -> Self {
        TraceEngine::builder().build()
    }

    pub fn builder() -> TraceEngineBuilder {
        TraceEngineBuilder::new()
    }

    pub fn state(&self) -> EngineState {
        self.shared.state()
    }

    /// Number of currently enabled sessions.
    pub fn session_count(&self) -> u32 {
        self.shared.registry.session_count()
    }

    /// Brings the engine up: registers the built-in provider and, when
    /// requested, opens the startup session. Streaming for that session is
    /// deferred until [`finish_init`](Self::finish_init).
    pub fn init(&self) {
        if self.shared.state() != EngineState::NotInitialized {
            debug_assert!(false, "engine initialized twice");
            warn!("init called on an engine that is already initialized");
            return;
        }
        let startup = {
            let mut core = self.shared.core.lock();
            let source = EventSource::register(&mut core.providers);
            let _ = self.shared.event_source.set(source);
            self.shared.set_state(EngineState::Initialized);
            std::mem::replace(&mut core.startup, StartupPolicy::Disabled)
        };
        info!(engine_id = self.shared.id, "trace engine initialized");
        let startup = match startup {
            StartupPolicy::Environment => startup_session_from_env(),
            StartupPolicy::Explicit(session) => Some(session),
            StartupPolicy::Disabled => None,
        };
        if let Some(session) = startup {
            self.enable_startup_session(session);
        }
    }

    fn enable_startup_session(&self, startup: StartupSession) {
        let output_path = expand_pid_template(&startup.output_path, std::process::id());
        let session_type = if startup.streaming {
            SessionType::FileStream
        } else {
            SessionType::File
        };
        let config = startup.config.unwrap_or_default();
        match self.enable_from_config(
            &config,
            session_type,
            SerializationFormat::NetTrace4,
            Some(PathBuf::from(output_path)),
            startup.buffer_size_mb,
            DEFAULT_RUNDOWN_KEYWORD,
            None,
        ) {
            Ok(id) => self.start_streaming(id),
            Err(err) => warn!(error = %err, "startup session rejected"),
        }
    }

    /// Replays work deferred from before background threads were permitted:
    /// queued streaming starts for still-live sessions, then the sample
    /// profiler gate, then queued disables. Both queues replay in FIFO order,
    /// exactly once.
    pub fn finish_init(&self) {
        let deferred_disables = {
            let mut core = self.shared.core.lock();
            let (streaming, disables) = core.deferred.begin_replay();
            for id in streaming {
                match self.shared.registry.lookup(id) {
                    Some(session) => session.start_streaming(),
                    None => debug!(session_id = %id, "deferred streaming start skipped, session gone"),
                }
            }
            self.shared.sampler.allow_start();
            disables
        };
        for id in deferred_disables {
            self.disable_now(id);
        }
        debug!("deferred startup work replayed");
    }

    /// Tears down every non-listener session and refuses new ones. Listener
    /// sessions keep collecting until the process exits.
    pub fn shutdown(&self) {
        if self.shared.state() != EngineState::Initialized {
            return;
        }
        {
            let _core = self.shared.core.lock();
            self.shared.set_state(EngineState::ShuttingDown);
        }
        for session in self.shared.registry.live_sessions() {
            if session.session_type() != SessionType::Listener {
                self.disable(session.id());
            }
        }
        let providers = {
            let mut core = self.shared.core.lock();
            core.checkpoints.clear();
            core.deferred.clear();
            core.providers.len()
        };
        info!(engine_id = self.shared.id, providers, "trace engine shut down");
    }

    /// Enables a session, making it visible to writers before returning.
    pub fn enable(&self, options: &SessionOptions) -> Result<SessionId, EngineError> {
        options.validate()?;
        let mut queue = CallbackQueue::new();
        let result = {
            let mut core = self.shared.core.lock();
            self.enable_locked(&mut core, options, &mut queue)
        };
        queue.drain();
        if let Ok(id) = &result {
            info!(
                session_id = %id,
                session_type = %options.session_type,
                providers = options.providers.len(),
                "session enabled"
            );
        }
        result
    }

    fn enable_locked(
        &self,
        core: &mut EngineCore,
        options: &SessionOptions,
        queue: &mut CallbackQueue,
    ) -> Result<SessionId, EngineError> {
        match self.shared.state() {
            EngineState::NotInitialized => return Err(EngineError::NotInitialized),
            EngineState::ShuttingDown => return Err(EngineError::ShuttingDown),
            EngineState::Initialized => {}
        }
        let slot = self
            .shared
            .registry
            .first_free_slot()
            .ok_or(EngineError::NoFreeSlots)?;
        self.shared.sampler.ensure_registered(&mut core.providers);
        // Everything fallible happens before the id is minted and the session
        // published, so a failed enable leaves no half-registered state.
        let sink: Arc<dyn EventSink> = match options.session_type {
            SessionType::IpcStream => options
                .stream
                .clone()
                .ok_or(EngineError::InvalidOptions("missing ipc stream"))?,
            _ => core.sink_factory.create_sink(
                options.session_type,
                options.output_path.as_deref(),
                options.buffer_size_mb,
            )?,
        };
        let id = self.shared.registry.mint_id(slot);
        let session = Arc::new(Session::new(id, slot, options, sink));
        if let Some(source) = self.shared.event_source.get() {
            session.add_provider_config(source.session_config());
        }
        self.shared.registry.publish(Arc::clone(&session));
        self.apply_session_filters(core, &session, true, queue);
        if session.requested_sampling() {
            self.shared.sampler.session_enabled();
        }
        Ok(id)
    }

    /// Enables a session from a provider configuration string. An empty
    /// string selects the default provider set. `stream` carries the caller's
    /// sink for `IpcStream` sessions.
    pub fn enable_from_config(
        &self,
        config: &str,
        session_type: SessionType,
        format: SerializationFormat,
        output_path: Option<PathBuf>,
        buffer_size_mb: u32,
        rundown_keyword: u64,
        stream: Option<Arc<dyn EventSink>>,
    ) -> Result<SessionId, EngineError> {
        let providers = if config.is_empty() {
            default_provider_configs()
        } else {
            parse_provider_config(config)?
        };
        let mut options = SessionOptions::new(session_type, format)
            .with_buffer_size_mb(buffer_size_mb)
            .with_providers(providers)
            .with_rundown_keyword(rundown_keyword);
        options.output_path = output_path;
        options.stream = stream;
        self.enable(&options)
    }

    /// Disables a session. Unknown and stale ids are ignored. Before
    /// [`finish_init`](Self::finish_init) the disable is deferred unless the
    /// control transport is still suspended.
    ///
    /// Blocks: the teardown spin-waits for in-flight writers to drain and
    /// then flushes the sink, so the calling thread must be free to stall
    /// and to perform I/O.
    pub fn disable(&self, id: SessionId) {
        {
            let mut core = self.shared.core.lock();
            let suspended = core
                .transport_suspended
                .as_ref()
                .map_or(false, |probe| probe());
            if !suspended && core.deferred.defer_disable(id) {
                debug!(session_id = %id, "session disable deferred");
                return;
            }
        }
        self.disable_now(id);
    }

    fn disable_now(&self, id: SessionId) {
        let mut queue = CallbackQueue::new();
        {
            let core = self.shared.core.lock();
            if self.shared.registry.session_count() > 0 {
                self.disable_locked(&core, id, &mut queue);
            }
        }
        queue.drain();
    }

    /// The teardown sequence. Order matters throughout: the process-info
    /// event and rundown happen while the slot is still writable; the
    /// `allow_write` bit goes down before the slot pointer; the flush and the
    /// final sequence point wait for write quiescence.
    fn disable_locked(&self, core: &EngineCore, id: SessionId, queue: &mut CallbackQueue) {
        let Some(session) = self.shared.registry.lookup(id) else {
            debug!(session_id = %id, "disable ignored for unknown session");
            return;
        };
        let slot = session.slot_index();
        if session.requested_sampling() {
            self.shared.sampler.session_disabled();
        }
        if let Some(source) = self.shared.event_source.get() {
            let payload = source.process_info_payload();
            dispatch::write_event(&self.shared, source.process_info_event(), &payload, None, None, None);
        }
        self.apply_session_filters(core, &session, false, queue);
        if session.rundown_keyword() != 0 && core.deferred.threads_permitted() {
            self.run_rundown(core, &session, queue);
        }
        self.shared.registry.retire(slot);
        self.shared.threads.wait_for_slot_quiescence(slot);
        session.flush();
        self.shared.registry.decrement_count();
        session.write_sequence_point();
        info!(
            session_id = %id,
            session_type = %session.session_type(),
            "session disabled"
        );
    }

    /// Runs the rundown pass on the calling thread: swaps the session's
    /// filter list for the rundown providers, enables them, replays the
    /// recorded execution checkpoints into the draining session, then
    /// disables the filters again. The thread's rundown marker routes the
    /// writes into that session alone.
    fn run_rundown(&self, core: &EngineCore, session: &Arc<Session>, queue: &mut CallbackQueue) {
        let Some(ctx) = current_thread_context(self.shared.id, &self.shared.threads) else {
            return;
        };
        session.enable_rundown();
        ctx.set_rundown_session(Some(session.id()));
        self.apply_session_filters(core, session, true, queue);
        if let Some(source) = self.shared.event_source.get() {
            for checkpoint in core.checkpoints.snapshot() {
                let payload = EventSource::checkpoint_payload(&checkpoint);
                dispatch::write_event(
                    &self.shared,
                    source.checkpoint_event(),
                    &payload,
                    None,
                    None,
                    None,
                );
            }
        }
        self.apply_session_filters(core, session, false, queue);
        ctx.set_rundown_session(None);
        debug!(session_id = %session.id(), checkpoints = core.checkpoints.len(), "rundown complete");
    }

    /// Applies or clears the filter every entry in the session's provider
    /// list contributes, queueing one callback per affected provider.
    fn apply_session_filters(
        &self,
        core: &EngineCore,
        session: &Arc<Session>,
        enable: bool,
        queue: &mut CallbackQueue,
    ) {
        let slot = session.slot_index();
        for config in session.provider_configs() {
            let Some(provider) = core.providers.get(&config.name) else {
                // Dormant entry: the provider may be created later, at which
                // point it picks this filter up.
                continue;
            };
            let filter = if enable {
                Some(SessionFilter {
                    keywords: config.keywords,
                    level: config.level,
                })
            } else {
                None
            };
            provider.apply_session(slot, filter);
            if let Some(callback) = provider.callback() {
                queue.push(
                    Arc::clone(provider.pending()),
                    callback,
                    CallbackRequest {
                        session_id: session.id(),
                        enabled: enable,
                        keywords: config.keywords,
                        level: config.level,
                        filter_data: config.filter_data.clone(),
                    },
                );
            }
        }
    }

    /// Starts streaming delivery for a session, deferring when background
    /// threads are not permitted yet. Unknown ids are ignored.
    pub fn start_streaming(&self, id: SessionId) {
        let mut core = self.shared.core.lock();
        match self.shared.registry.lookup(id) {
            Some(session) => {
                if core.deferred.defer_streaming_start(id) {
                    debug!(session_id = %id, "streaming start deferred");
                } else {
                    session.start_streaming();
                }
            }
            None => debug!(session_id = %id, "start_streaming ignored for unknown session"),
        }
    }

    /// Resolves an id to its live session.
    pub fn get_session(&self, id: SessionId) -> Option<Arc<Session>> {
        if self.shared.state() == EngineState::NotInitialized {
            debug_assert!(false, "get_session called before init");
            return None;
        }
        let _core = self.shared.core.lock();
        self.shared.registry.lookup(id)
    }

    /// Lock-free liveness check for an id.
    pub fn is_session_enabled(&self, id: SessionId) -> bool {
        self.shared.registry.contains(id)
    }

    /// Pops the oldest buffered event from a listener session.
    pub fn get_next_event(&self, id: SessionId) -> Option<EventInstance> {
        let session = self.get_session(id)?;
        session.next_event()
    }

    /// Records a named checkpoint for replay into every future rundown pass.
    pub fn add_rundown_execution_checkpoint(&self, name: &str, timestamp: Timestamp) -> bool {
        let mut core = self.shared.core.lock();
        core.checkpoints
            .push(ExecutionCheckpoint::new(name, timestamp));
        debug!(name, timestamp, "execution checkpoint recorded");
        true
    }

    /// Registers a provider. Sessions that already listed its name pick it up
    /// immediately, and their callbacks fire before this returns.
    pub fn create_provider(
        &self,
        name: &str,
        callback: Option<ProviderCallback>,
    ) -> Result<Provider, EngineError> {
        if name.is_empty() {
            return Err(EngineError::EmptyProviderName);
        }
        let mut queue = CallbackQueue::new();
        let result = {
            let mut core = self.shared.core.lock();
            if core.providers.contains(name) {
                Err(EngineError::ProviderExists(name.to_string()))
            } else {
                let inner = Arc::new(ProviderInner::new(name, callback));
                core.providers.insert(Arc::clone(&inner));
                self.activate_provider_for_live_sessions(&inner, &mut queue);
                Ok(Provider::from_inner(inner))
            }
        };
        queue.drain();
        if let Ok(provider) = &result {
            debug!(provider = provider.name(), "provider created");
        }
        result
    }

    fn activate_provider_for_live_sessions(
        &self,
        provider: &Arc<ProviderInner>,
        queue: &mut CallbackQueue,
    ) {
        for session in self.shared.registry.live_sessions() {
            for config in session.provider_configs() {
                if config.name != provider.name() {
                    continue;
                }
                provider.apply_session(
                    session.slot_index(),
                    Some(SessionFilter {
                        keywords: config.keywords,
                        level: config.level,
                    }),
                );
                if let Some(callback) = provider.callback() {
                    queue.push(
                        Arc::clone(provider.pending()),
                        callback,
                        CallbackRequest {
                            session_id: session.id(),
                            enabled: true,
                            keywords: config.keywords,
                            level: config.level,
                            filter_data: config.filter_data.clone(),
                        },
                    );
                }
            }
        }
    }

    /// Looks up a registered provider by name. Providers whose deletion is
    /// pending are not returned.
    pub fn get_provider(&self, name: &str) -> Option<Provider> {
        let core = self.shared.core.lock();
        core.providers
            .get(name)
            .filter(|p| !p.is_delete_deferred())
            .map(Provider::from_inner)
    }

    /// Unregisters a provider. The call first blocks, outside the lock, until
    /// every in-flight callback for the provider has finished; calling it
    /// from inside a provider callback therefore deadlocks. With sessions
    /// still running afterwards the removal is deferred until tracing stops.
    /// Callers must [`unset_callback`](Provider::unset_callback) first.
    pub fn delete_provider(&self, provider: &Provider) {
        let wait_needed = {
            let _core = self.shared.core.lock();
            provider.inner().mark_delete_deferred();
            debug_assert!(
                !provider.inner().has_callback(),
                "delete_provider called with a live callback"
            );
            provider.inner().clear_callback();
            // Callbacks drain after the lock is released, so one may still
            // be in flight even with no session left.
            provider.inner().pending().pending() > 0
        };
        if wait_needed {
            provider.inner().pending().wait_zero();
        }
        let mut core = self.shared.core.lock();
        if self.tracing_active() {
            debug!(provider = provider.name(), "provider delete deferred");
        } else {
            core.providers.remove(provider.name());
            debug!(provider = provider.name(), "provider deleted");
        }
    }

    /// Adds a provider entry to a live session's filter list. Returns `false`
    /// when the id no longer names a live session.
    pub fn add_provider_to_session(&self, id: SessionId, config: ProviderConfig) -> bool {
        if config.name.is_empty() {
            return false;
        }
        let mut queue = CallbackQueue::new();
        let added = {
            let core = self.shared.core.lock();
            match self.shared.registry.lookup(id) {
                Some(session) => {
                    session.add_provider_config(config.clone());
                    if let Some(provider) = core.providers.get(&config.name) {
                        provider.apply_session(
                            session.slot_index(),
                            Some(SessionFilter {
                                keywords: config.keywords,
                                level: config.level,
                            }),
                        );
                        if let Some(callback) = provider.callback() {
                            queue.push(
                                Arc::clone(provider.pending()),
                                callback,
                                CallbackRequest {
                                    session_id: id,
                                    enabled: true,
                                    keywords: config.keywords,
                                    level: config.level,
                                    filter_data: config.filter_data.clone(),
                                },
                            );
                        }
                    }
                    true
                }
                None => false,
            }
        };
        queue.drain();
        added
    }

    /// Writes an event through the lock-free dispatch path.
    pub fn write_event(
        &self,
        event: &TraceEvent,
        payload: &[u8],
        activity_id: Option<Uuid>,
        related_activity_id: Option<Uuid>,
    ) {
        dispatch::write_event(
            &self.shared,
            event,
            payload,
            activity_id,
            related_activity_id,
            None,
        );
    }

    /// Writes a thread-sample event attributed to `sampled_thread_id`. The
    /// capture thread recorded on the event is the calling (sampler) thread.
    pub fn write_sample_profile_event(&self, sampled_thread_id: u64, payload: &[u8]) {
        if let Some(event) = self.shared.sampler.sample_event() {
            dispatch::write_event(
                &self.shared,
                &event,
                payload,
                None,
                None,
                Some(sampled_thread_id),
            );
        }
    }

    /// Whether the embedder's sampling thread should currently be running.
    pub fn is_sampling_armed(&self) -> bool {
        self.shared.sampler.is_armed()
    }

    pub fn sampling_rate_ns(&self) -> u64 {
        self.shared.sampler.sampling_rate_ns()
    }

    pub fn set_sampling_rate_ns(&self, rate_ns: u64) {
        self.shared.sampler.set_sampling_rate_ns(rate_ns);
    }

    /// The calling thread's current activity id under this engine.
    pub fn thread_activity_id(&self) -> Option<Uuid> {
        current_thread_context(self.shared.id, &self.shared.threads)?.activity_id()
    }

    /// Sets or clears the calling thread's activity id. Events written
    /// without an explicit activity id inherit it.
    pub fn set_thread_activity_id(&self, activity_id: Option<Uuid>) {
        if let Some(ctx) = current_thread_context(self.shared.id, &self.shared.threads) {
            ctx.set_activity_id(activity_id);
        }
    }

    /// The calling thread's activity id, minting one on first use. `None`
    /// only during thread teardown.
    pub fn get_or_create_thread_activity_id(&self) -> Option<Uuid> {
        current_thread_context(self.shared.id, &self.shared.threads)
            .map(|ctx| ctx.get_or_create_activity_id())
    }

    fn tracing_active(&self) -> bool {
        self.shared.state() >= EngineState::Initialized
            && self.shared.registry.session_count() > 0
    }
}

impl Default for TraceEngine {
    fn default() -> Self {
        TraceEngine::new()
    }
}
