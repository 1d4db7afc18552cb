//! # Cache Errors
//!
//! Store unavailability is deliberately absent here: it degrades to default
//! return values instead of surfacing as an error.

use redis::RedisError;
use thiserror::Error;

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors surfaced to cache callers.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The value could not be turned into a payload (including null values).
    #[error("failed to encode value: {0}")]
    Encode(String),
    /// The payload was empty, malformed, or of a different type.
    #[error("failed to decode value: {0}")]
    Decode(String),
    /// Sorted-set scores must be comparable.
    #[error("sorted-set score must not be NaN")]
    InvalidScore,
    /// A write TTL must be at least one millisecond; the store rejects `PX 0`.
    #[error("time to live must be positive")]
    InvalidTtl,
    /// The batch owning this result was dropped before `execute`.
    #[error("batch was dropped before execute")]
    BatchDiscarded,
    /// The store rejected or failed an operation on a live connection.
    #[error(transparent)]
    Transport(#[from] RedisError),
}
