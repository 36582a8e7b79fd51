//! Sample profiler arming.
//!
//! The engine does not run the sampling thread itself; the embedder does.
//! This module keeps the bookkeeping that decides *whether* sampling should
//! run: how many sessions asked for the profiler provider, whether thread
//! creation is permitted yet, and the requested sampling interval. The
//! embedder polls [`TraceEngine::is_sampling_armed`](crate::engine::TraceEngine::is_sampling_armed)
//! and emits samples through
//! [`write_sample_profile_event`](crate::engine::TraceEngine::write_sample_profile_event).

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::debug;

use crate::provider::{ProviderInner, ProviderTable, TraceEvent};
use crate::types::EventLevel;

/// Name sessions use to request sampling.
pub const SAMPLE_PROFILER_PROVIDER_NAME: &str = "Tracemux-SampleProfiler";

/// Default sampling interval: one millisecond.
pub const DEFAULT_SAMPLING_RATE_NS: u64 = 1_000_000;

/// Event id of the thread-sample event.
pub(crate) const SAMPLE_EVENT_ID: u32 = 0;

pub(crate) struct SampleProfiler {
    provider: OnceCell<Arc<ProviderInner>>,
    sample_event: OnceCell<Arc<TraceEvent>>,
    /// Sessions currently requesting sampling.
    sessions: AtomicU32,
    /// True when the embedder should be sampling right now.
    armed: AtomicBool,
    /// Latched once background threads are permitted.
    can_start: AtomicBool,
    rate_ns: AtomicU64,
}

impl SampleProfiler {
    pub(crate) fn new() -> Self {
        SampleProfiler {
            provider: OnceCell::new(),
            sample_event: OnceCell::new(),
            sessions: AtomicU32::new(0),
            armed: AtomicBool::new(false),
            can_start: AtomicBool::new(false),
            rate_ns: AtomicU64::new(DEFAULT_SAMPLING_RATE_NS),
        }
    }

    /// Registers the profiler provider and its sample event on first use.
    /// Runs under the configuration lock during session enable.
    pub(crate) fn ensure_registered(&self, table: &mut ProviderTable) {
        if self.provider.get().is_some() {
            return;
        }
        let provider = Arc::new(ProviderInner::new(SAMPLE_PROFILER_PROVIDER_NAME, None));
        let event = provider.add_event(SAMPLE_EVENT_ID, 0, 0, EventLevel::Informational);
        table.insert(Arc::clone(&provider));
        let _ = self.provider.set(provider);
        let _ = self.sample_event.set(event);
    }

    pub(crate) fn sample_event(&self) -> Option<Arc<TraceEvent>> {
        self.sample_event.get().cloned()
    }

    /// One more session wants sampling.
    pub(crate) fn session_enabled(&self) {
        let sessions = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        if self.can_start.load(Ordering::SeqCst) {
            self.armed.store(true, Ordering::SeqCst);
        }
        debug!(sessions, "sample profiler session added");
    }

    /// One session stopped wanting sampling; disarm on the last one.
    pub(crate) fn session_disabled(&self) {
        let previous = self.sessions.load(Ordering::SeqCst);
        debug_assert!(previous > 0, "sample profiler disable underflow");
        if previous == 0 {
            return;
        }
        let sessions = self.sessions.fetch_sub(1, Ordering::SeqCst) - 1;
        if sessions == 0 {
            self.armed.store(false, Ordering::SeqCst);
        }
        debug!(sessions, "sample profiler session removed");
    }

    /// Background threads are permitted from now on; arm retroactively if
    /// sessions were already waiting on the profiler.
    pub(crate) fn allow_start(&self) {
        self.can_start.store(true, Ordering::SeqCst);
        if self.sessions.load(Ordering::SeqCst) > 0 {
            self.armed.store(true, Ordering::SeqCst);
        }
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    pub(crate) fn sampling_rate_ns(&self) -> u64 {
        self.rate_ns.load(Ordering::SeqCst)
    }

    pub(crate) fn set_sampling_rate_ns(&self, rate_ns: u64) {
        debug_assert!(rate_ns > 0, "sampling rate must be positive");
        self.rate_ns.store(rate_ns.max(1), Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arming_waits_for_thread_permission() {
        let profiler = SampleProfiler::new();
        profiler.session_enabled();
        assert!(!profiler.is_armed());
        profiler.allow_start();
        assert!(profiler.is_armed());
    }

    #[test]
    fn test_arms_immediately_once_permitted() {
        let profiler = SampleProfiler::new();
        profiler.allow_start();
        assert!(!profiler.is_armed());
        profiler.session_enabled();
        assert!(profiler.is_armed());
    }

    #[test]
    fn test_disarms_on_last_session() {
        let profiler = SampleProfiler::new();
        profiler.allow_start();
        profiler.session_enabled();
        profiler.session_enabled();
        profiler.session_disabled();
        assert!(profiler.is_armed());
        profiler.session_disabled();
        assert!(!profiler.is_armed());
    }

    #[test]
    fn test_registers_provider_once() {
        let profiler = SampleProfiler::new();
        let mut table = ProviderTable::new();
        profiler.ensure_registered(&mut table);
        profiler.ensure_registered(&mut table);
        assert_eq!(table.len(), 1);
        assert!(table.contains(SAMPLE_PROFILER_PROVIDER_NAME));
        let event = profiler.sample_event().unwrap();
        assert_eq!(event.event_id(), SAMPLE_EVENT_ID);
        assert_eq!(event.level(), EventLevel::Informational);
        assert_eq!(event.keywords(), 0);
    }

    #[test]
    fn test_sampling_rate_roundtrip() {
        let profiler = SampleProfiler::new();
        assert_eq!(profiler.sampling_rate_ns(), DEFAULT_SAMPLING_RATE_NS);
        profiler.set_sampling_rate_ns(250_000);
        assert_eq!(profiler.sampling_rate_ns(), 250_000);
    }
}
