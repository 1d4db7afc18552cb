//! # Expiration and Score Types
//!
//! Time-to-live and expiry types shared by the provider and the embedded
//! store, plus the textual score format used for sorted sets.
//!
//! ## Design Principles
//!
//! 1. **Millisecond Wire Units**: TTLs travel as milliseconds (`PX`, `PTTL`,
//!    `PEXPIRE`, `PEXPIREAT`) so sub-second expirations survive the round trip.
//! 2. **Redis Semantics**: `Ttl` mirrors the `-2` / `-1` / remaining encoding.
//! 3. **Exact Scores**: Scores are formatted with the shortest representation
//!    that parses back to the identical `f64`, so exact-score lookups hit.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// TTL state reported by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// Key is missing or already expired.
    Missing,
    /// Key exists without expiration.
    NoExpiry,
    /// Key expires after the provided duration.
    ExpiresIn(Duration),
}

impl Ttl {
    /// Decodes a `PTTL` reply.
    ///
    /// Returns `None` for negative values other than the two sentinels.
    pub fn from_millis_reply(value: i64) -> Option<Ttl> {
        match value {
            -2 => Some(Ttl::Missing),
            -1 => Some(Ttl::NoExpiry),
            v if v >= 0 => Some(Ttl::ExpiresIn(Duration::from_millis(v as u64))),
            _ => None,
        }
    }

    /// Encodes this state as a `PTTL` reply.
    pub fn as_millis_reply(&self) -> i64 {
        match self {
            Ttl::Missing => -2,
            Ttl::NoExpiry => -1,
            Ttl::ExpiresIn(remaining) => duration_millis(*remaining) as i64,
        }
    }

    /// Encodes this state as a `TTL` (seconds) reply.
    pub fn as_seconds_reply(&self) -> i64 {
        match self {
            Ttl::Missing => -2,
            Ttl::NoExpiry => -1,
            Ttl::ExpiresIn(remaining) => remaining.as_secs() as i64,
        }
    }

    /// Remaining time, if the key exists and has an expiration.
    pub fn remaining(&self) -> Option<Duration> {
        match self {
            Ttl::ExpiresIn(remaining) => Some(*remaining),
            _ => None,
        }
    }
}

/// Expiration applied to an existing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Relative to now.
    After(Duration),
    /// Absolute wall-clock instant.
    At(SystemTime),
}

impl From<Duration> for Expiry {
    fn from(ttl: Duration) -> Self {
        Expiry::After(ttl)
    }
}

impl From<SystemTime> for Expiry {
    fn from(at: SystemTime) -> Self {
        Expiry::At(at)
    }
}

/// Whole milliseconds in `duration`, rounding sub-millisecond remainders up
/// so a non-zero TTL never collapses to zero.
pub fn duration_millis(duration: Duration) -> u64 {
    let millis = duration.as_millis();
    let rounded = if duration.subsec_nanos() % 1_000_000 != 0 {
        millis + 1
    } else {
        millis
    };
    rounded.min(u64::MAX as u128) as u64
}

/// Milliseconds since the Unix epoch; instants before the epoch clamp to 0.
pub fn unix_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|since| since.as_millis().min(u64::MAX as u128) as u64)
        .unwrap_or(0)
}

/// Formats a sorted-set score for the wire.
pub fn format_score(score: f64) -> String {
    if score == f64::INFINITY {
        "+inf".to_string()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        // `Display` for f64 is the shortest string that round-trips exactly.
        score.to_string()
    }
}

/// Parses a sorted-set score; NaN is rejected.
pub fn parse_score(data: &[u8]) -> Option<f64> {
    let text = std::str::from_utf8(data).ok()?;
    let score = match text {
        "+inf" | "inf" => f64::INFINITY,
        "-inf" => f64::NEG_INFINITY,
        other => other.parse::<f64>().ok()?,
    };
    if score.is_nan() {
        return None;
    }
    Some(score)
}
