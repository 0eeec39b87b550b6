//! Error types for the relay event bus.

use thiserror::Error;

/// Result type alias using relay's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for event bus operations.
///
/// Only [`Error::Config`] is fatal, and only at construction time. Everything
/// else is either handled inside the subscriber state machine or surfaced to a
/// single publish call.
#[derive(Error, Debug)]
pub enum Error {
    /// Backend connectivity failed (transient; drives reconnect)
    #[error("Connection error: {0}")]
    Connection(String),

    /// No pooled connection became available within the acquire timeout
    #[error("Pool exhausted: no connection available after {waited_ms}ms")]
    PoolExhausted { waited_ms: u64 },

    /// A received payload or channel name could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// A subscriber callback failed, panicked, or timed out
    #[error("Callback error: {0}")]
    Callback(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input (event type, pattern)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The bus is shutting down and no longer accepts work
    #[error("Event bus is shutting down")]
    ShuttingDown,

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a caller may reasonably retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::PoolExhausted { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
