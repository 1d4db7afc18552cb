//! # Cache Provider
//!
//! Purpose: Typed key/value operations over the shared store connection,
//! with every payload passing through the configured serializer.
//!
//! ## Design Principles
//! 1. **Always-Present Cache**: When the store is unavailable, operations
//!    return their documented default (`None`, `false`, `0`) instead of
//!    failing. A connection dropped mid-operation counts as unavailable.
//! 2. **Loud Programmer Errors**: Serialization failures and errors reported
//!    by a live store propagate to the caller.
//! 3. **One Round Trip**: Each operation lazily ensures the connection and
//!    issues exactly one command.
//!
//! Set and sorted-set operations live in `sets` and `sorted_sets`.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use redis::{Cmd, ErrorKind, FromRedisValue};

use cachet_common::{duration_millis, unix_millis, Expiry, StoreConfig, Ttl};

use crate::batch::BatchProvider;
use crate::connection::ConnectionManager;
use crate::error::{CacheError, CacheResult};
use crate::notifications::NotificationChannel;
use crate::serializer::{JsonSerializer, Serializer};

/// Caching provider over one lazily established store connection.
pub struct CacheProvider<S = JsonSerializer> {
    pub(crate) manager: Arc<ConnectionManager>,
    pub(crate) serializer: Arc<S>,
    notifications: NotificationChannel,
}

impl<S> std::fmt::Debug for CacheProvider<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheProvider")
            .field("manager", &self.manager)
            .finish_non_exhaustive()
    }
}

impl CacheProvider<JsonSerializer> {
    /// Provider storing JSON payloads.
    pub fn json(config: StoreConfig) -> Self {
        CacheProvider::new(config, JsonSerializer)
    }
}

impl<S> CacheProvider<S> {
    /// True while a live store connection is held. Never dials.
    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    pub fn serializer(&self) -> &S {
        &self.serializer
    }

    /// Publish/subscribe channel sharing this provider's store.
    pub fn notifications(&self) -> &NotificationChannel {
        &self.notifications
    }

    /// Releases every connection. Later operations behave as if the store
    /// were unavailable.
    pub fn close(&self) {
        self.notifications.shutdown();
        self.manager.close();
    }
}

impl<S: Serializer> CacheProvider<S> {
    /// Creates a provider; the store is dialed on first use.
    pub fn new(config: StoreConfig, serializer: S) -> Self {
        let manager = Arc::new(ConnectionManager::new(config));
        let notifications = NotificationChannel::new(Arc::clone(&manager));
        CacheProvider {
            manager,
            serializer: Arc::new(serializer),
            notifications,
        }
    }

    /// Establishes the connection now; `false` if the store is unavailable.
    pub async fn connect(&self) -> bool {
        self.manager.ensure_connected().await.is_some()
    }

    pub(crate) async fn run<T: FromRedisValue>(&self, command: &Cmd, default: T) -> CacheResult<T> {
        self.manager.run(command, default).await
    }

    /// Stores `value` without expiration.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> CacheResult<()> {
        self.set_with_expiry(key, value, None).await
    }

    /// Stores `value`, expiring after `ttl`.
    pub async fn set_with_ttl<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> CacheResult<()> {
        self.set_with_expiry(key, value, Some(ttl)).await
    }

    /// Stores `value`; `None` leaves it without expiration.
    ///
    /// A zero `ttl` fails with `CacheError::InvalidTtl` before anything is
    /// sent.
    pub async fn set_with_expiry<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        let payload = self.serializer.serialize(value)?;
        let command = set_command(key, &payload, ttl)?;
        self.run(&command, ()).await
    }

    /// Reads and decodes the value under `key`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        let payload: Option<Vec<u8>> = self.run(&redis::cmd("GET").arg(key).clone(), None).await?;
        payload
            .map(|payload| self.serializer.deserialize(&payload))
            .transpose()
    }

    /// Deletes `key`; `true` only if it existed.
    pub async fn remove(&self, key: &str) -> CacheResult<bool> {
        Ok(self.key_delete(&[key]).await? > 0)
    }

    /// Deletes several keys, returning how many existed.
    pub async fn key_delete<K: AsRef<str>>(&self, keys: &[K]) -> CacheResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut command = redis::cmd("DEL");
        for key in keys {
            command.arg(key.as_ref());
        }
        self.run(&command, 0).await
    }

    pub async fn key_exists(&self, key: &str) -> CacheResult<bool> {
        self.run(redis::cmd("EXISTS").arg(key), false).await
    }

    /// Sets a relative (`Duration`) or absolute (`SystemTime`) expiration.
    pub async fn key_expire(&self, key: &str, expiry: impl Into<Expiry>) -> CacheResult<bool> {
        let command = match expiry.into() {
            Expiry::After(ttl) => redis::cmd("PEXPIRE").arg(key).arg(duration_millis(ttl)).clone(),
            Expiry::At(at) => redis::cmd("PEXPIREAT").arg(key).arg(unix_millis(at)).clone(),
        };
        self.run(&command, false).await
    }

    /// Clears the expiration; `true` if one was removed.
    pub async fn key_persist(&self, key: &str) -> CacheResult<bool> {
        self.run(redis::cmd("PERSIST").arg(key), false).await
    }

    /// Renames `key`, replacing `new_key`; `false` if `key` does not exist.
    pub async fn key_rename(&self, key: &str, new_key: &str) -> CacheResult<bool> {
        let command = redis::cmd("RENAME").arg(key).arg(new_key).clone();
        let reply = self
            .manager
            .request(|mut connection| async move {
                let renamed: redis::RedisResult<()> = command.query_async(&mut connection).await;
                renamed
            })
            .await;
        match reply {
            None => Ok(false),
            Some(Ok(())) => Ok(true),
            Some(Err(err)) if is_missing_key(&err) => Ok(false),
            Some(Err(err)) => Err(err.into()),
        }
    }

    /// Remaining time to live; `None` for a missing key or one without
    /// expiration.
    pub async fn key_time_to_live(&self, key: &str) -> CacheResult<Option<Duration>> {
        let millis: i64 = self.run(redis::cmd("PTTL").arg(key), -2).await?;
        Ok(Ttl::from_millis_reply(millis).and_then(|ttl| ttl.remaining()))
    }

    /// Type name the store reports for `key` (`"string"`, `"set"`, `"zset"`,
    /// ...); `None` for a missing key or an unavailable store.
    pub async fn key_type(&self, key: &str) -> CacheResult<Option<String>> {
        let kind: String = self.run(redis::cmd("TYPE").arg(key), "none".to_string()).await?;
        Ok(Some(kind).filter(|kind| kind != "none"))
    }

    /// Starts a deferred batch sharing this provider's connection; `None`
    /// when the store is unavailable.
    pub async fn create_batch(&self) -> Option<BatchProvider<S>> {
        self.manager.ensure_connected().await?;
        Some(BatchProvider::new(
            Arc::clone(&self.manager),
            Arc::clone(&self.serializer),
        ))
    }

    /// See [`NotificationChannel::subscribe`].
    pub async fn subscribe<F>(&self, channel: &str, handler: F) -> CacheResult<bool>
    where
        F: Fn(&str, &[u8]) + Send + Sync + 'static,
    {
        self.notifications.subscribe(channel, handler).await
    }

    /// See [`NotificationChannel::subscribe_pattern`].
    pub async fn subscribe_pattern<F>(&self, pattern: &str, handler: F) -> CacheResult<bool>
    where
        F: Fn(&str, &[u8]) + Send + Sync + 'static,
    {
        self.notifications.subscribe_pattern(pattern, handler).await
    }

    /// See [`NotificationChannel::unsubscribe`].
    pub async fn unsubscribe(&self, channel_or_pattern: &str) -> CacheResult<()> {
        self.notifications.unsubscribe(channel_or_pattern).await
    }

    /// See [`NotificationChannel::publish`].
    pub async fn publish(&self, channel: &str, message: impl AsRef<[u8]>) -> CacheResult<u64> {
        self.notifications.publish(channel, message.as_ref()).await
    }
}

/// `SET key payload [PX ttl]`.
pub(crate) fn set_command(key: &str, payload: &[u8], ttl: Option<Duration>) -> CacheResult<Cmd> {
    let mut command = redis::cmd("SET");
    command.arg(key).arg(payload);
    if let Some(ttl) = ttl {
        if ttl.is_zero() {
            return Err(CacheError::InvalidTtl);
        }
        command.arg("PX").arg(duration_millis(ttl));
    }
    Ok(command)
}

fn is_missing_key(err: &redis::RedisError) -> bool {
    err.kind() == ErrorKind::ResponseError && err.to_string().contains("no such key")
}

impl<S> Drop for CacheProvider<S> {
    fn drop(&mut self) {
        self.close();
    }
}
