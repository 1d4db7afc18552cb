//! # Batch Provider
//!
//! Purpose: Queue cache operations locally and send them to the store as one
//! pipeline when `execute` is called.
//!
//! ## Design Principles
//! 1. **Deferred I/O**: Queuing only records the command and hands back a
//!    `Pending` handle; nothing touches the socket until `execute`.
//! 2. **Drain per Execute**: Each `execute` takes exactly the operations
//!    queued since the previous one. A handle can only resolve from the
//!    flush that carried its own command.
//! 3. **Ordered Resolution**: Commands keep their queue order in the
//!    pipeline, and replies are matched to handles in that same order.
//! 4. **Shared Connection**: The batch borrows the provider's connection
//!    manager, so `execute` reconnects after a drop. When the store is
//!    unavailable every handle resolves to its default (`None`, `false`,
//!    `()`), the same as a direct call.
//! 5. **All or Nothing on Errors**: The store answers a pipeline as a unit;
//!    a server error for any command fails every handle in that flush.
//!
//! ## Structure Overview
//!
//! ```text
//! set/get/remove ──▶ queue: [(Cmd, slot)] ──execute──▶ redis::pipe() ──▶ ConnectionManager
//!        │                                                                     │
//!        └──── Pending<T> ◀──── Outcome per slot, in queue order ◀─────────────┘
//! ```

use std::future::{Future, IntoFuture};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use redis::{Cmd, RedisError, RedisResult, Value};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time;
use tracing::debug;

use crate::connection::ConnectionManager;
use crate::error::{CacheError, CacheResult};
use crate::provider::set_command;
use crate::serializer::{JsonSerializer, Serializer};

type Decode<T> = Box<dyn FnOnce(Value) -> CacheResult<T> + Send>;

/// How the flush carrying one queued command ended for that command.
#[derive(Debug)]
enum Outcome {
    Reply(Value),
    /// The store could not be reached, or the connection dropped mid-flush.
    Unavailable,
    Failed(RedisError),
}

/// Result of a queued operation; await it after `execute`.
///
/// Resolves to `CacheError::BatchDiscarded` if the batch is dropped with
/// the operation still queued.
#[must_use = "a queued operation's outcome is only observed by awaiting it"]
pub struct Pending<T> {
    outcome: oneshot::Receiver<Outcome>,
    decode: Decode<T>,
    timeout: Duration,
}

impl<T> std::fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pending").field("timeout", &self.timeout).finish()
    }
}

impl<T: Default + Send + 'static> IntoFuture for Pending<T> {
    type Output = CacheResult<T>;
    type IntoFuture = Pin<Box<dyn Future<Output = CacheResult<T>> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        let Pending {
            outcome,
            decode,
            timeout,
        } = self;
        Box::pin(async move {
            match time::timeout(timeout, outcome).await {
                Ok(Ok(Outcome::Reply(value))) => decode(value),
                Ok(Ok(Outcome::Unavailable)) => Ok(T::default()),
                Ok(Ok(Outcome::Failed(err))) => Err(err.into()),
                Ok(Err(_)) => Err(CacheError::BatchDiscarded),
                Err(_) => Err(RedisError::from(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "batch operation was not executed in time",
                ))
                .into()),
            }
        })
    }
}

/// Deferred operations sharing the provider's store connection.
pub struct BatchProvider<S = JsonSerializer> {
    manager: Arc<ConnectionManager>,
    serializer: Arc<S>,
    queue: Mutex<Vec<(Cmd, oneshot::Sender<Outcome>)>>,
}

impl<S> std::fmt::Debug for BatchProvider<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchProvider")
            .field("addr", &self.manager.config().addr())
            .field("queued", &self.len())
            .finish()
    }
}

impl<S> BatchProvider<S> {
    /// Number of operations waiting for the next `execute`.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sends everything queued since the previous call as one pipeline and
    /// resolves the queued handles from its replies.
    ///
    /// An unavailable store is not an error: the handles resolve to their
    /// defaults. A server error fails the handles and is also returned.
    pub async fn execute(&self) -> CacheResult<()> {
        let queued = std::mem::take(&mut *self.queue.lock());
        if queued.is_empty() {
            return Ok(());
        }
        let (commands, slots): (Vec<Cmd>, Vec<oneshot::Sender<Outcome>>) =
            queued.into_iter().unzip();
        debug!(commands = commands.len(), addr = %self.manager.config().addr(), "executing batch");

        let mut pipe = redis::pipe();
        for command in commands {
            pipe.add_command(command);
        }
        let replies = self
            .manager
            .request(|mut connection| async move {
                let replies: RedisResult<Vec<Value>> = pipe.query_async(&mut connection).await;
                replies
            })
            .await;

        match replies {
            None => {
                for slot in slots {
                    let _ = slot.send(Outcome::Unavailable);
                }
                Ok(())
            }
            Some(Ok(replies)) => {
                let mut replies = replies.into_iter();
                for slot in slots {
                    let outcome = match replies.next() {
                        Some(value) => Outcome::Reply(value),
                        None => Outcome::Failed(short_reply()),
                    };
                    let _ = slot.send(outcome);
                }
                Ok(())
            }
            Some(Err(err)) => {
                for slot in slots {
                    let _ = slot.send(Outcome::Failed(replicate(&err)));
                }
                Err(err.into())
            }
        }
    }

    fn enqueue<T, F>(&self, command: Cmd, decode: F) -> Pending<T>
    where
        F: FnOnce(Value) -> CacheResult<T> + Send + 'static,
    {
        let (slot, outcome) = oneshot::channel();
        self.queue.lock().push((command, slot));
        Pending {
            outcome,
            decode: Box::new(decode),
            timeout: self.manager.config().operation_timeout,
        }
    }
}

impl<S: Serializer> BatchProvider<S> {
    pub(crate) fn new(manager: Arc<ConnectionManager>, serializer: Arc<S>) -> Self {
        BatchProvider {
            manager,
            serializer,
            queue: Mutex::new(Vec::new()),
        }
    }

    /// Queues a write without expiration.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> CacheResult<Pending<()>> {
        self.set_with_expiry(key, value, None)
    }

    /// Queues a write expiring after `ttl`.
    pub fn set_with_ttl<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> CacheResult<Pending<()>> {
        self.set_with_expiry(key, value, Some(ttl))
    }

    /// Queues a write; the value is serialized immediately and a zero `ttl`
    /// fails with `CacheError::InvalidTtl` without queuing anything.
    pub fn set_with_expiry<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> CacheResult<Pending<()>> {
        let payload = self.serializer.serialize(value)?;
        let command = set_command(key, &payload, ttl)?;
        Ok(self.enqueue(command, |value| Ok(redis::from_owned_redis_value(value)?)))
    }

    /// Queues a read; decoding happens when the handle resolves.
    pub fn get<T: DeserializeOwned + Send + 'static>(&self, key: &str) -> Pending<Option<T>> {
        let serializer = Arc::clone(&self.serializer);
        self.enqueue(redis::cmd("GET").arg(key).clone(), move |value| {
            let payload: Option<Vec<u8>> = redis::from_owned_redis_value(value)?;
            payload
                .map(|payload| serializer.deserialize(&payload))
                .transpose()
        })
    }

    /// Queues a delete; resolves to `true` if the key existed.
    pub fn remove(&self, key: &str) -> Pending<bool> {
        self.enqueue(redis::cmd("DEL").arg(key).clone(), |value| {
            let removed: u64 = redis::from_owned_redis_value(value)?;
            Ok(removed > 0)
        })
    }

    pub fn key_exists(&self, key: &str) -> Pending<bool> {
        self.enqueue(redis::cmd("EXISTS").arg(key).clone(), |value| {
            Ok(redis::from_owned_redis_value(value)?)
        })
    }
}

/// A copy of a pipeline failure for one queued handle.
fn replicate(err: &RedisError) -> RedisError {
    RedisError::from((err.kind(), "batch failed", err.to_string()))
}

fn short_reply() -> RedisError {
    RedisError::from((
        redis::ErrorKind::ResponseError,
        "batch reply missing",
        "the store answered fewer commands than were sent".to_string(),
    ))
}
