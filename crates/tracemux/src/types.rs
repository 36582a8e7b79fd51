//! Core identifier and enum types shared across the engine.
//!
//! ## Session identifiers
//!
//! A [`SessionId`] is an opaque `u64` handed out by
//! [`TraceEngine::enable`](crate::engine::TraceEngine::enable). Internally it packs a
//! registry slot index into the low bits and a per-slot generation counter into the
//! high bits. Generations start at 1, so a valid id is never zero and an id minted
//! for an earlier occupant of a reused slot can never match the current occupant.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Maximum number of concurrently enabled sessions.
pub const MAX_SESSIONS: usize = 64;

/// Low bits of a [`SessionId`] that carry the registry slot index.
const SLOT_BITS: u32 = 8;
const SLOT_MASK: u64 = (1 << SLOT_BITS) - 1;

/// Keyword mask the built-in runtime provider is enabled with by default.
pub const DEFAULT_RUNTIME_KEYWORDS: u64 = 0x4c14fccbd;

/// Keyword mask the built-in private runtime provider is enabled with by default.
pub const DEFAULT_RUNTIME_PRIVATE_KEYWORDS: u64 = 0x4002000b;

/// Keyword mask used to request the rundown pass when a session is disabled.
///
/// A session created with a zero rundown keyword skips rundown entirely.
pub const DEFAULT_RUNDOWN_KEYWORD: u64 = 0x80020139;

/// Default per-session buffer budget, in megabytes.
pub const DEFAULT_BUFFER_SIZE_MB: u32 = 1;

/// Output path used by the environment-driven startup session when none is given.
pub const DEFAULT_OUTPUT_PATH: &str = "trace.nettrace";

/// Nanoseconds-since-epoch style timestamp attached to execution checkpoints.
pub type Timestamp = i64;

/// Opaque handle for an enabled session.
///
/// Ids are never reused: disabling a session and enabling a new one in the same
/// slot produces a different id, and the old id is rejected by every lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn from_parts(generation: u64, slot: usize) -> Self {
        debug_assert!(slot < MAX_SESSIONS);
        debug_assert!(generation > 0);
        SessionId((generation << SLOT_BITS) | slot as u64)
    }

    /// Registry slot index encoded in this id.
    pub(crate) fn slot(self) -> usize {
        (self.0 & SLOT_MASK) as usize
    }

    /// Generation counter encoded in this id.
    pub(crate) fn generation(self) -> u64 {
        self.0 >> SLOT_BITS
    }

    /// Raw integer form, suitable for logging or crossing an IPC boundary.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Rebuilds an id from its raw integer form.
    ///
    /// Returns `None` for zero and for values whose slot bits are out of range.
    /// A `Some` result only means the id is well formed, not that the session
    /// is still alive.
    pub fn from_u64(raw: u64) -> Option<Self> {
        if raw == 0 || (raw & SLOT_MASK) as usize >= MAX_SESSIONS || raw >> SLOT_BITS == 0 {
            None
        } else {
            Some(SessionId(raw))
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Lifecycle state of a [`TraceEngine`](crate::engine::TraceEngine).
///
/// The state only ever moves forward: `NotInitialized` to `Initialized` to
/// `ShuttingDown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum EngineState {
    /// Engine constructed but [`init`](crate::engine::TraceEngine::init) not yet called.
    NotInitialized = 0,
    /// Sessions may be enabled and events dispatched.
    Initialized = 1,
    /// Non-listener sessions are being torn down; writes still drain.
    ShuttingDown = 2,
}

impl EngineState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => EngineState::NotInitialized,
            1 => EngineState::Initialized,
            _ => EngineState::ShuttingDown,
        }
    }
}

/// Where a session delivers its events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionType {
    /// Buffered capture flushed to a file path.
    File,
    /// Buffered capture streamed to a file path as it fills.
    FileStream,
    /// Buffered capture streamed over a caller-supplied transport.
    IpcStream,
    /// Buffered capture consumed in-process through [`get_next_event`](crate::engine::TraceEngine::get_next_event).
    Listener,
    /// Events forwarded to a kernel tracing descriptor, bypassing the buffer manager.
    UserEvents,
}

impl SessionType {
    /// Whether sessions of this type own an in-process event buffer.
    ///
    /// `UserEvents` sessions hand events straight to the kernel descriptor and
    /// therefore do not need a buffer budget.
    pub fn uses_buffer_manager(self) -> bool {
        !matches!(self, SessionType::UserEvents)
    }

    /// Whether the session delivers to a path on the local filesystem.
    pub fn writes_to_file(self) -> bool {
        matches!(self, SessionType::File | SessionType::FileStream)
    }
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionType::File => "file",
            SessionType::FileStream => "file-stream",
            SessionType::IpcStream => "ipc-stream",
            SessionType::Listener => "listener",
            SessionType::UserEvents => "user-events",
        };
        f.write_str(name)
    }
}

/// On-disk / on-wire serialization format requested for a session.
///
/// The engine core never encodes events itself; the format is carried as session
/// metadata for whichever [`EventSink`](crate::sink::EventSink) implementation is
/// attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SerializationFormat {
    /// Legacy v3 format.
    NetPerf3,
    /// Current v4 format.
    NetTrace4,
}

impl Default for SerializationFormat {
    fn default() -> Self {
        SerializationFormat::NetTrace4
    }
}

/// Severity attached to events and session filters.
///
/// The numeric order matters: a session enabled at level `n` admits events with
/// level `<= n`, and `LogAlways` events pass every level filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum EventLevel {
    /// Always admitted, regardless of the session's level filter.
    LogAlways = 0,
    Critical = 1,
    Error = 2,
    Warning = 3,
    Informational = 4,
    Verbose = 5,
}

impl EventLevel {
    /// Maps a raw numeric level, clamping unknown values to `Verbose`.
    pub fn from_u32(value: u32) -> Self {
        match value {
            0 => EventLevel::LogAlways,
            1 => EventLevel::Critical,
            2 => EventLevel::Error,
            3 => EventLevel::Warning,
            4 => EventLevel::Informational,
            _ => EventLevel::Verbose,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventLevel::LogAlways => "log-always",
            EventLevel::Critical => "critical",
            EventLevel::Error => "error",
            EventLevel::Warning => "warning",
            EventLevel::Informational => "informational",
            EventLevel::Verbose => "verbose",
        };
        f.write_str(name)
    }
}
