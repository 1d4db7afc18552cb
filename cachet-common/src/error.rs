//! # Error Types
//!
//! Engine-level failures surfaced by the embedded store.

use thiserror::Error;

/// Result type for engine operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Engine-level failures, rendered by the server as RESP error replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Key is missing (or already expired).
    #[error("no such key")]
    NotFound,
    /// Operation targeted a key holding a different kind of value.
    #[error("Operation against a key holding the wrong kind of value")]
    WrongType,
    /// Argument could not be parsed as an integer.
    #[error("value is not an integer or out of range")]
    NotAnInteger,
    /// Argument could not be parsed as a float score.
    #[error("value is not a valid float")]
    NotAFloat,
    /// Unsupported option combination.
    #[error("syntax error")]
    Syntax,
}

impl StoreError {
    /// RESP error prefix used when the error is written to the wire.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::WrongType => "WRONGTYPE",
            _ => "ERR",
        }
    }
}
