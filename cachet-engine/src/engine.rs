//! # Engine Trait
//!
//! Purpose: Decouple the server's command dispatch from the storage backend.
//!
//! ## Design Principles
//! 1. **Strategy Pattern**: The server holds `Arc<dyn KVEngine>`-style
//!    backends and never reaches into their layout.
//! 2. **Redis Semantics**: Missing and expired keys behave identically;
//!    type mismatches fail with `StoreError::WrongType`.

use std::sync::Arc;
use std::time::Duration;

use cachet_common::{StoreResult, Ttl};

/// Storage operations the embedded server dispatches to.
pub trait KVEngine: Send + Sync {
    /// Returns the string value of `key`.
    fn get(&self, key: &[u8]) -> StoreResult<Option<Arc<[u8]>>>;

    /// Stores a string value, replacing any previous value and expiration.
    fn set(&self, key: Vec<u8>, value: Vec<u8>, ttl: Option<Duration>) -> StoreResult<()>;

    /// Removes a key of any type. Returns whether a live key was removed.
    fn delete(&self, key: &[u8]) -> StoreResult<bool>;

    fn exists(&self, key: &[u8]) -> StoreResult<bool>;

    /// Redis type name of the value under `key`, `None` when missing.
    fn key_type(&self, key: &[u8]) -> StoreResult<Option<&'static str>>;

    /// Sets a relative expiration. A zero TTL expires the key immediately.
    ///
    /// Returns false when the key does not exist.
    fn expire(&self, key: &[u8], ttl: Duration) -> StoreResult<bool>;

    /// Clears the expiration. Returns false when there was none.
    fn persist(&self, key: &[u8]) -> StoreResult<bool>;

    /// Moves the value and expiration of `key` to `new_key`.
    ///
    /// Fails with `StoreError::NotFound` when `key` does not exist.
    fn rename(&self, key: &[u8], new_key: Vec<u8>) -> StoreResult<()>;

    fn ttl(&self, key: &[u8]) -> StoreResult<Ttl>;

    /// Adds members to a set. Returns how many were new.
    fn sadd(&self, key: &[u8], members: Vec<Vec<u8>>) -> StoreResult<usize>;

    /// Removes members from a set. Returns how many were present.
    fn srem(&self, key: &[u8], members: &[Vec<u8>]) -> StoreResult<usize>;

    fn sismember(&self, key: &[u8], member: &[u8]) -> StoreResult<bool>;

    fn smembers(&self, key: &[u8]) -> StoreResult<Vec<Vec<u8>>>;

    /// Adds or re-scores a member. Returns true when the member was new.
    fn zadd(&self, key: &[u8], score: f64, member: Vec<u8>) -> StoreResult<bool>;

    /// Members with `min <= score <= max` in ascending (score, member) order,
    /// optionally windowed by `(offset, count)`.
    fn zrange_by_score(
        &self,
        key: &[u8],
        min: f64,
        max: f64,
        limit: Option<(usize, usize)>,
    ) -> StoreResult<Vec<Vec<u8>>>;

    /// Removes members with `min <= score <= max`. Returns how many.
    fn zrem_range_by_score(&self, key: &[u8], min: f64, max: f64) -> StoreResult<usize>;
}
