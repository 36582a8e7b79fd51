//! The engine's built-in providers.
//!
//! Two providers are registered during engine initialization. The engine
//! provider carries the process-info event and is implicitly subscribed by
//! every session. The rundown provider carries the execution-checkpoint event
//! and is only ever enabled for a session's rundown pass, through the filter
//! list that pass installs. All built-in events are declared with no keywords
//! at `LogAlways`, so they pass any filter on their provider.

use std::sync::Arc;

use crate::checkpoint::ExecutionCheckpoint;
use crate::config::{ProviderConfig, ALL_KEYWORDS, RUNTIME_RUNDOWN_PROVIDER_NAME};
use crate::provider::{ProviderInner, ProviderTable, TraceEvent};
use crate::types::EventLevel;

/// Name of the engine's built-in provider.
pub const ENGINE_PROVIDER_NAME: &str = "Tracemux-Engine";

pub(crate) const PROCESS_INFO_EVENT_ID: u32 = 1;
pub(crate) const EXECUTION_CHECKPOINT_EVENT_ID: u32 = 1;

/// Payload field separator: process-info joins its strings with NUL, and the
/// checkpoint payload separates the label from the timestamp with NUL.
const FIELD_SEPARATOR: u8 = 0;

pub(crate) struct EventSource {
    process_info_event: Arc<TraceEvent>,
    checkpoint_event: Arc<TraceEvent>,
    command_line: String,
}

impl EventSource {
    /// Creates both providers and their events and registers them in the
    /// table. Called once during engine initialization.
    pub(crate) fn register(table: &mut ProviderTable) -> Self {
        let provider = Arc::new(ProviderInner::new(ENGINE_PROVIDER_NAME, None));
        let process_info_event =
            provider.add_event(PROCESS_INFO_EVENT_ID, 0, 0, EventLevel::LogAlways);
        table.insert(provider);

        let rundown_provider =
            Arc::new(ProviderInner::new(RUNTIME_RUNDOWN_PROVIDER_NAME, None));
        let checkpoint_event =
            rundown_provider.add_event(EXECUTION_CHECKPOINT_EVENT_ID, 0, 0, EventLevel::LogAlways);
        table.insert(rundown_provider);

        EventSource {
            process_info_event,
            checkpoint_event,
            command_line: process_command_line(),
        }
    }

    /// The filter entry appended to every new session so the process-info
    /// event always has a path into it.
    pub(crate) fn session_config(&self) -> ProviderConfig {
        ProviderConfig::new(ENGINE_PROVIDER_NAME, ALL_KEYWORDS, EventLevel::LogAlways)
    }

    pub(crate) fn process_info_event(&self) -> &Arc<TraceEvent> {
        &self.process_info_event
    }

    pub(crate) fn checkpoint_event(&self) -> &Arc<TraceEvent> {
        &self.checkpoint_event
    }

    /// Process-info payload: command line, OS and architecture, NUL-separated.
    pub(crate) fn process_info_payload(&self) -> Vec<u8> {
        let os = std::env::consts::OS;
        let arch = std::env::consts::ARCH;
        let mut payload =
            Vec::with_capacity(self.command_line.len() + os.len() + arch.len() + 2);
        payload.extend_from_slice(self.command_line.as_bytes());
        payload.push(FIELD_SEPARATOR);
        payload.extend_from_slice(os.as_bytes());
        payload.push(FIELD_SEPARATOR);
        payload.extend_from_slice(arch.as_bytes());
        payload
    }

    /// Checkpoint payload: the label, a NUL, then the timestamp as eight
    /// little-endian bytes.
    pub(crate) fn checkpoint_payload(checkpoint: &ExecutionCheckpoint) -> Vec<u8> {
        let mut payload = Vec::with_capacity(checkpoint.name.len() + 9);
        payload.extend_from_slice(checkpoint.name.as_bytes());
        payload.push(FIELD_SEPARATOR);
        payload.extend_from_slice(&checkpoint.timestamp.to_le_bytes());
        payload
    }
}

fn process_command_line() -> String {
    std::env::args().collect::<Vec<_>>().join(" ")
}
