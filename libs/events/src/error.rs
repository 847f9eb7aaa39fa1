//! Error types for event handling.

use thiserror::Error;

/// Errors that can occur when decoding event inputs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The liveness status string is not recognised.
    #[error("unknown liveness status: {0}")]
    UnknownLiveness(String),

    /// The line is not a valid report.
    #[error("malformed liveness report: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
