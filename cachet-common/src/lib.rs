// cachet-common - Shared types for Cachet
//
// This crate defines the store configuration, the TTL and expiry types, and
// the glob matcher shared by the cache provider and the embedded store.

pub mod config;
pub mod error;
pub mod glob;
pub mod types;

// Re-export for convenience
pub use config::*;
pub use error::*;
pub use glob::glob_match;
pub use types::*;
