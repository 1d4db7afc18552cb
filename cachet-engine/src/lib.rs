//! # Cachet Embedded Engine
//!
//! Purpose: In-process key/value store backing the embedded server, with
//! string, set, and sorted-set values and per-key expiration.

mod engine;
mod memory;

pub use engine::KVEngine;
pub use memory::MemoryEngine;
