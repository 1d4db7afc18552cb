//! # Cachet Embedded Store
//!
//! Purpose: Serve the RESP2 command subset the cache provider uses, backed by
//! `cachet-engine`, so the provider can be exercised without an external
//! store.
//!
//! ## Design Principles
//! 1. **Redis Semantics**: Replies, error prefixes, and pub/sub frames follow
//!    Redis so the same client talks to either.
//! 2. **Observable**: `ServerMetrics` exposes connection and command counts.

mod metrics;
mod protocol;
mod pubsub;
mod server;

pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use server::{EmbeddedServer, DATABASES};
