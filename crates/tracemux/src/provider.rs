//! Providers and the events they define.
//!
//! A provider groups related events under a name. Sessions request providers
//! by name with a keyword mask and level; the intersection of a session's
//! request and an event's declaration decides enablement. The result is cached
//! on each event as a 64-bit mask with one bit per session slot, so the hot
//! path answers "is anyone listening" with a single atomic load.
//!
//! ## Enablement rule
//!
//! An event is enabled for a session when the provider is enabled for that
//! session and
//!
//! * the event declares no keywords, or the session's mask intersects them, and
//! * the event's level is `LogAlways`, or the session's level admits it.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::callback::{PendingCallbacks, ProviderCallback};
use crate::types::{EventLevel, SessionId, MAX_SESSIONS};

/// One session's request against a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SessionFilter {
    pub(crate) keywords: u64,
    pub(crate) level: EventLevel,
}

impl SessionFilter {
    /// Whether an event with the given declaration passes this filter.
    pub(crate) fn admits(&self, event_keywords: u64, event_level: EventLevel) -> bool {
        let keyword_ok = event_keywords == 0 || (self.keywords & event_keywords) != 0;
        let level_ok = event_level == EventLevel::LogAlways || self.level >= event_level;
        keyword_ok && level_ok
    }
}

/// Definition of one event, with its cached per-slot enablement mask.
///
/// Handles are cheap to clone and remain valid after their provider is
/// deleted; the mask simply decays to zero once no session enables them.
#[derive(Debug)]
pub struct TraceEvent {
    provider_name: Arc<str>,
    event_id: u32,
    event_version: u32,
    keywords: u64,
    level: EventLevel,
    /// Bit `i` set when the session in slot `i` enables this event.
    enabled_mask: AtomicU64,
}

impl TraceEvent {
    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    pub fn event_id(&self) -> u32 {
        self.event_id
    }

    pub fn event_version(&self) -> u32 {
        self.event_version
    }

    pub fn keywords(&self) -> u64 {
        self.keywords
    }

    pub fn level(&self) -> EventLevel {
        self.level
    }

    /// Whether any session currently enables this event. This is the guard
    /// callers should check before building a payload.
    #[inline(always)]
    pub fn is_enabled(&self) -> bool {
        self.enabled_mask.load(Ordering::Acquire) != 0
    }

    #[inline(always)]
    pub(crate) fn is_enabled_for_slot(&self, slot: usize) -> bool {
        self.enabled_mask.load(Ordering::Acquire) & (1 << slot) != 0
    }

    fn update_slot(&self, slot: usize, enabled: bool) {
        let bit = 1u64 << slot;
        if enabled {
            self.enabled_mask.fetch_or(bit, Ordering::Release);
        } else {
            self.enabled_mask.fetch_and(!bit, Ordering::Release);
        }
    }
}

/// Shared provider state. Public access goes through [`Provider`].
pub(crate) struct ProviderInner {
    name: Arc<str>,
    callback: Mutex<Option<ProviderCallback>>,
    /// Per-slot filters. Locked before `events` everywhere.
    filters: Mutex<[Option<SessionFilter>; MAX_SESSIONS]>,
    events: Mutex<Vec<Arc<TraceEvent>>>,
    /// Bit `i` set when the session in slot `i` enables this provider.
    enabled_mask: AtomicU64,
    pending: Arc<PendingCallbacks>,
    delete_deferred: AtomicBool,
}

impl ProviderInner {
    pub(crate) fn new(name: &str, callback: Option<ProviderCallback>) -> Self {
        ProviderInner {
            name: Arc::from(name),
            callback: Mutex::new(callback),
            filters: Mutex::new([None; MAX_SESSIONS]),
            events: Mutex::new(Vec::new()),
            enabled_mask: AtomicU64::new(0),
            pending: Arc::new(PendingCallbacks::new()),
            delete_deferred: AtomicBool::new(false),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn callback(&self) -> Option<ProviderCallback> {
        self.callback.lock().clone()
    }

    pub(crate) fn has_callback(&self) -> bool {
        self.callback.lock().is_some()
    }

    pub(crate) fn clear_callback(&self) {
        *self.callback.lock() = None;
    }

    /// Installs or clears the filter one session contributes, refreshing the
    /// cached mask of every event this provider has defined.
    pub(crate) fn apply_session(&self, slot: usize, filter: Option<SessionFilter>) {
        let mut filters = self.filters.lock();
        let events = self.events.lock();
        filters[slot] = filter;
        let bit = 1u64 << slot;
        match filter {
            Some(_) => self.enabled_mask.fetch_or(bit, Ordering::Release),
            None => self.enabled_mask.fetch_and(!bit, Ordering::Release),
        };
        for event in events.iter() {
            let enabled =
                filter.is_some_and(|f| f.admits(event.keywords(), event.level()));
            event.update_slot(slot, enabled);
        }
    }

    /// Defines a new event. Its mask is seeded from the filters of sessions
    /// that are already running, so an event added mid-session is live
    /// immediately.
    pub(crate) fn add_event(
        &self,
        event_id: u32,
        event_version: u32,
        keywords: u64,
        level: EventLevel,
    ) -> Arc<TraceEvent> {
        let filters = self.filters.lock();
        let mut events = self.events.lock();
        let mut mask = 0u64;
        for (slot, filter) in filters.iter().enumerate() {
            if let Some(f) = filter {
                if f.admits(keywords, level) {
                    mask |= 1 << slot;
                }
            }
        }
        let event = Arc::new(TraceEvent {
            provider_name: Arc::clone(&self.name),
            event_id,
            event_version,
            keywords,
            level,
            enabled_mask: AtomicU64::new(mask),
        });
        events.push(Arc::clone(&event));
        event
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled_mask.load(Ordering::Acquire) != 0
    }

    pub(crate) fn enabled_mask_bits(&self) -> u64 {
        self.enabled_mask.load(Ordering::Acquire)
    }

    pub(crate) fn pending(&self) -> &Arc<PendingCallbacks> {
        &self.pending
    }

    pub(crate) fn mark_delete_deferred(&self) {
        self.delete_deferred.store(true, Ordering::Release);
    }

    pub(crate) fn is_delete_deferred(&self) -> bool {
        self.delete_deferred.load(Ordering::Acquire)
    }
}

/// Handle to a registered provider.
///
/// Obtained from [`TraceEngine::create_provider`](crate::engine::TraceEngine::create_provider);
/// clones share the same underlying provider.
#[derive(Clone)]
pub struct Provider {
    inner: Arc<ProviderInner>,
}

impl Provider {
    pub(crate) fn from_inner(inner: Arc<ProviderInner>) -> Self {
        Provider { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<ProviderInner> {
        &self.inner
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Defines a new event under this provider.
    pub fn add_event(
        &self,
        event_id: u32,
        event_version: u32,
        keywords: u64,
        level: EventLevel,
    ) -> Arc<TraceEvent> {
        self.inner.add_event(event_id, event_version, keywords, level)
    }

    /// Whether any session currently enables this provider.
    pub fn is_enabled(&self) -> bool {
        self.inner.is_enabled()
    }

    /// Whether the session occupying the slot encoded in `session_id`
    /// currently enables this provider.
    pub fn is_enabled_for(&self, session_id: SessionId) -> bool {
        self.inner.enabled_mask_bits() & (1 << session_id.slot()) != 0
    }

    /// Drops the enablement callback. Must be called before handing the
    /// provider to [`delete_provider`](crate::engine::TraceEngine::delete_provider).
    pub fn unset_callback(&self) {
        self.inner.clear_callback();
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("name", &self.inner.name())
            .field("enabled_mask", &self.inner.enabled_mask_bits())
            .finish()
    }
}

/// Name-keyed registry of providers. All access happens under the engine's
/// configuration lock.
pub(crate) struct ProviderTable {
    providers: HashMap<String, Arc<ProviderInner>>,
}

impl ProviderTable {
    pub(crate) fn new() -> Self {
        ProviderTable {
            providers: HashMap::new(),
        }
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    pub(crate) fn insert(&mut self, provider: Arc<ProviderInner>) {
        self.providers
            .insert(provider.name().to_string(), provider);
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<ProviderInner>> {
        self.providers.get(name).cloned()
    }

    pub(crate) fn remove(&mut self, name: &str) -> Option<Arc<ProviderInner>> {
        self.providers.remove(name)
    }

    pub(crate) fn len(&self) -> usize {
        self.providers.len()
    }
}
