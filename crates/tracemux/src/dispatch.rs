//! The event write path.
//!
//! ## Performance Requirements
//!
//! Dispatch is the hot path and takes no locks. The disabled case costs two
//! atomic loads (engine state, event mask). The enabled case adds, per
//! matching session, one marker store with a fence and one `arc_swap` slot
//! load. Payloads are borrowed, never copied, until a sink decides to keep
//! them.
//!
//! ## Teardown handshake
//!
//! For each writable slot the writer sets its per-thread marker, then loads
//! the slot pointer and writes if it is still populated. Disable clears the
//! `allow_write` bit, nulls the pointer, then waits for markers to drain.
//! Either the writer sees the null pointer and skips, or the disabler sees
//! the marker and waits; the arc swap guard keeps the session alive for
//! whichever write is still in flight.

use chrono::Utc;
use uuid::Uuid;

use crate::engine::EngineShared;
use crate::provider::TraceEvent;
use crate::sink::EventRecord;
use crate::thread::{current_thread_context, ThreadContext};
use crate::types::{EngineState, SessionId, MAX_SESSIONS};

/// Fans an event out to every session that enables it.
///
/// `attributed_thread_id` overrides the thread the event is attributed to;
/// sample-profile writes use it to point at the sampled thread rather than
/// the sampler.
pub(crate) fn write_event(
    shared: &EngineShared,
    event: &TraceEvent,
    payload: &[u8],
    activity_id: Option<Uuid>,
    related_activity_id: Option<Uuid>,
    attributed_thread_id: Option<u64>,
) {
    if shared.state() < EngineState::Initialized {
        return;
    }
    if !event.is_enabled() {
        return;
    }
    // No context means the thread is tearing down; nothing to write into.
    let Some(ctx) = current_thread_context(shared.id, &shared.threads) else {
        return;
    };
    let activity_id = activity_id.or_else(|| ctx.activity_id());
    let record = EventRecord {
        provider_name: event.provider_name(),
        event_id: event.event_id(),
        event_version: event.event_version(),
        keywords: event.keywords(),
        level: event.level(),
        payload,
        activity_id,
        related_activity_id,
        thread_id: attributed_thread_id.unwrap_or_else(|| ctx.thread_id()),
        capture_thread_id: ctx.thread_id(),
        timestamp: Utc::now(),
    };

    // A thread running rundown routes every write into the draining session;
    // the regular fan-out would skip it because its filters are only enabled
    // for the rundown window.
    if let Some(rundown_id) = ctx.rundown_session() {
        write_to_rundown_session(shared, rundown_id, event, &record);
        return;
    }

    for slot in 0..MAX_SESSIONS {
        // Checked fresh per slot so writers stop volunteering markers for a
        // slot as soon as its disable has begun.
        if !shared.registry.slot_writable(slot) {
            continue;
        }
        if !event.is_enabled_for_slot(slot) {
            continue;
        }
        write_to_slot(shared, &ctx, slot, &record);
    }
}

#[inline(always)]
fn write_to_slot(shared: &EngineShared, ctx: &ThreadContext, slot: usize, record: &EventRecord<'_>) {
    ctx.begin_write(slot);
    {
        // The slot may have been nulled between the bit check and here; the
        // guard pins whatever occupant we observe.
        let guard = shared.registry.slot_guard(slot);
        if let Some(session) = guard.as_ref() {
            session.write(record);
        }
    }
    ctx.end_write(slot);
}

fn write_to_rundown_session(
    shared: &EngineShared,
    rundown_id: SessionId,
    event: &TraceEvent,
    record: &EventRecord<'_>,
) {
    let slot = rundown_id.slot();
    if !event.is_enabled_for_slot(slot) {
        return;
    }
    // The disabling thread owns this slot for the rundown window; the slot is
    // unpublished only after the window closes, so no marker is needed.
    let guard = shared.registry.slot_guard(slot);
    if let Some(session) = guard.as_ref() {
        if session.id() == rundown_id && session.is_rundown_enabled() {
            session.write(record);
        }
    }
}
