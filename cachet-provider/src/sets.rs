//! Set operations.
//!
//! Members are serialized exactly like cache values and compared by their
//! payload bytes: two logically equal values that serialize differently are
//! distinct members.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CacheResult;
use crate::provider::CacheProvider;
use crate::serializer::Serializer;

impl<S: Serializer> CacheProvider<S> {
    /// Adds `member`; `true` if it was not already present.
    pub async fn set_add<T: Serialize + ?Sized>(&self, key: &str, member: &T) -> CacheResult<bool> {
        let payload = self.serializer.serialize(member)?;
        self.set_add_raw(key, &payload).await
    }

    /// Adds an already encoded member.
    pub async fn set_add_raw(&self, key: &str, member: &[u8]) -> CacheResult<bool> {
        let added: u64 = self.run(redis::cmd("SADD").arg(key).arg(member), 0).await?;
        Ok(added > 0)
    }

    /// Removes `members`, returning how many were present.
    pub async fn set_remove<T: Serialize>(&self, key: &str, members: &[T]) -> CacheResult<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        let payloads = members
            .iter()
            .map(|member| self.serializer.serialize(member))
            .collect::<CacheResult<Vec<_>>>()?;
        self.run(redis::cmd("SREM").arg(key).arg(&payloads), 0).await
    }

    pub async fn in_set<T: Serialize + ?Sized>(&self, key: &str, member: &T) -> CacheResult<bool> {
        let payload = self.serializer.serialize(member)?;
        self.in_set_raw(key, &payload).await
    }

    /// Membership test for an already encoded member.
    pub async fn in_set_raw(&self, key: &str, member: &[u8]) -> CacheResult<bool> {
        self.run(redis::cmd("SISMEMBER").arg(key).arg(member), false)
            .await
    }

    /// Every member, decoded. Order is unspecified.
    pub async fn set_members<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Vec<T>> {
        let payloads: Vec<Vec<u8>> = self.run(redis::cmd("SMEMBERS").arg(key), Vec::new()).await?;
        payloads
            .iter()
            .map(|payload| self.serializer.deserialize(payload))
            .collect()
    }
}
