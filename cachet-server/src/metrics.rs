//! # Server Metrics
//!
//! Provide lightweight counters for connections, commands, and error replies.
//!
//! ## Design Principles
//! 1. **Accumulator Pattern**: Use atomic counters to aggregate events cheaply.
//! 2. **Zero-Cost Access**: Expose snapshots as plain structs without heap work.
//!
//! ## Notes
//! - `Ordering::Relaxed` is sufficient because no cross-field ordering is
//!   required, only eventual consistency.

use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of all server metrics at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Connections accepted since start.
    pub connections_total: u64,
    /// Connections currently open.
    pub connections_active: u64,
    /// Commands dispatched, including failed ones.
    pub commands_total: u64,
    /// Error replies written.
    pub errors_total: u64,
    /// Messages handed to subscribers by `PUBLISH`.
    pub messages_delivered: u64,
}

/// Thread-safe metrics aggregator for the server.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    connections_total: AtomicU64,
    connections_active: AtomicU64,
    commands_total: AtomicU64,
    errors_total: AtomicU64,
    messages_delivered: AtomicU64,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an accepted connection.
    pub fn record_connection_open(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a closed connection.
    pub fn record_connection_close(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Records one dispatched command and whether it failed.
    pub fn record_command(&self, failed: bool) {
        self.commands_total.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.errors_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_delivered(&self, count: u64) {
        self.messages_delivered.fetch_add(count, Ordering::Relaxed);
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            commands_total: self.commands_total.load(Ordering::Relaxed),
            errors_total: self.errors_total.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
        }
    }
}
