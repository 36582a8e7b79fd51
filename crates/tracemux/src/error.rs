//! Error types surfaced by the engine's fallible control-plane operations.
//!
//! The write path never returns errors; an event that cannot be delivered is
//! dropped. Errors exist only on session and provider management calls, where
//! the caller can actually do something about them.

use thiserror::Error;

use crate::types::MAX_SESSIONS;

/// Errors returned by session and provider management operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine has not been initialized yet.
    #[error("engine is not initialized")]
    NotInitialized,

    /// The engine is shutting down and no longer accepts new sessions.
    #[error("engine is shutting down")]
    ShuttingDown,

    /// Session options failed validation before any slot was claimed.
    #[error("invalid session options: {0}")]
    InvalidOptions(&'static str),

    /// Every session slot is occupied.
    #[error("all {MAX_SESSIONS} session slots are in use")]
    NoFreeSlots,

    /// A provider configuration string could not be parsed.
    #[error("provider config entry {index} is malformed: {reason}")]
    InvalidProviderConfig {
        /// Zero-based index of the offending comma-separated entry.
        index: usize,
        reason: &'static str,
    },

    /// A provider with the same name is already registered.
    #[error("provider {0:?} is already registered")]
    ProviderExists(String),

    /// The provider name was empty.
    #[error("provider name is empty")]
    EmptyProviderName,

    /// The sink factory failed to produce a writer for the session.
    #[error("failed to create session sink: {0}")]
    SinkCreation(String),
}
