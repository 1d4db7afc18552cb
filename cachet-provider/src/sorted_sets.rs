//! # Sorted-Set Operations
//!
//! Members are serialized payloads ordered by an `f64` score, ascending.
//!
//! ## Design Principles
//! 1. **Exact Scores**: Lookups and removals by score use floating-point
//!    equality with no tolerance; scores travel in a format that parses
//!    back to the identical value.
//! 2. **First Tie Wins**: A lookup by score returns only the first member
//!    at that score in the store's order. Other tied members are not
//!    reported.
//! 3. **No NaN**: A NaN score is rejected before anything is sent.

use serde::de::DeserializeOwned;
use serde::Serialize;

use cachet_common::format_score;

use crate::error::{CacheError, CacheResult};
use crate::provider::CacheProvider;
use crate::serializer::Serializer;

impl<S: Serializer> CacheProvider<S> {
    /// Inserts `member` at `score`, or moves it there if already present.
    ///
    /// Returns `true` when the member is new to the set.
    pub async fn sorted_set_add<T: Serialize + ?Sized>(
        &self,
        key: &str,
        score: f64,
        member: &T,
    ) -> CacheResult<bool> {
        if score.is_nan() {
            return Err(CacheError::InvalidScore);
        }
        let payload = self.serializer.serialize(member)?;
        let command = redis::cmd("ZADD").arg(key).arg(format_score(score)).arg(payload).clone();
        self.run(&command, false).await
    }

    /// First member whose score equals `score` exactly.
    pub async fn sorted_set_get_by_score<T: DeserializeOwned>(
        &self,
        key: &str,
        score: f64,
    ) -> CacheResult<Option<T>> {
        if score.is_nan() {
            return Err(CacheError::InvalidScore);
        }
        let bound = format_score(score);
        let command = redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(&bound)
            .arg(&bound)
            .arg("LIMIT")
            .arg(0)
            .arg(1)
            .clone();
        let payloads: Vec<Vec<u8>> = self.run(&command, Vec::new()).await?;
        payloads
            .first()
            .map(|payload| self.serializer.deserialize(payload))
            .transpose()
    }

    /// Every member by ascending score.
    pub async fn sorted_set_range<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Vec<T>> {
        let command = redis::cmd("ZRANGEBYSCORE").arg(key).arg("-inf").arg("+inf").clone();
        let payloads: Vec<Vec<u8>> = self.run(&command, Vec::new()).await?;
        payloads
            .iter()
            .map(|payload| self.serializer.deserialize(payload))
            .collect()
    }

    /// Removes every member at exactly `score`, returning how many.
    pub async fn sorted_set_remove_by_score(&self, key: &str, score: f64) -> CacheResult<u64> {
        if score.is_nan() {
            return Err(CacheError::InvalidScore);
        }
        let bound = format_score(score);
        self.run(redis::cmd("ZREMRANGEBYSCORE").arg(key).arg(&bound).arg(&bound), 0)
            .await
    }
}
