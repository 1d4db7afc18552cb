//! # Cachet
//!
//! Purpose: A caching provider in front of a Redis-compatible store. Typed
//! values go through a pluggable serializer; one lazily established
//! connection is shared by every operation.
//!
//! ## Design Principles
//! 1. **Always-Present Cache**: An unreachable store degrades every
//!    operation to its default result instead of an error.
//! 2. **Single Connect Gate**: At most one connection attempt runs at a time
//!    per provider; everything else reads the published handle lock-free.
//! 3. **Deferred Batches**: `BatchProvider` queues operations and sends them
//!    as one `redis` pipeline per `execute`, degrading like direct calls.
//! 4. **Raw Notifications**: Pub/sub payloads bypass the serializer.
//!
//! ```no_run
//! use cachet::{CacheProvider, JsonSerializer, StoreConfig};
//!
//! # async fn demo() -> cachet::CacheResult<()> {
//! let cache = CacheProvider::new(StoreConfig::new("127.0.0.1", 6379), JsonSerializer);
//! cache.set("answer", &42).await?;
//! let answer: Option<u32> = cache.get("answer").await?;
//! # Ok(())
//! # }
//! ```

mod batch;
mod connection;
mod error;
mod notifications;
mod provider;
mod serializer;
mod sets;
mod sorted_sets;

pub use batch::{BatchProvider, Pending};
pub use connection::ConnectionManager;
pub use error::{CacheError, CacheResult};
pub use notifications::{Handler, NotificationChannel, Subscription};
pub use provider::CacheProvider;
pub use serializer::{JsonSerializer, MessagePackSerializer, Serializer};

pub use redis::RedisError;
pub use cachet_common::{Expiry, StoreConfig};
