//! Error types for the gateway domain

use thiserror::Error;

/// Transport-level errors
///
/// Split into transient failures (retried with backoff) and fatal ones
/// (the circuit opens immediately).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("I/O failure: {0}")]
    Io(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Connection closed by peer")]
    Closed,

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Unresolvable endpoint: {0}")]
    Unresolvable(String),
}

impl TransportError {
    /// Fatal errors will not go away by retrying the same endpoint
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::InvalidEndpoint(_) | TransportError::Unresolvable(_)
        )
    }
}

/// Reasons an inbound frame was dropped
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameParseError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Frame is not an object with a type field")]
    MissingType,

    #[error("Malformed {kind} frame: {reason}")]
    Malformed { kind: String, reason: String },
}
