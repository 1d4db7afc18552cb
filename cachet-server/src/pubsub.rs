//! # Pub/Sub Broker
//!
//! Purpose: Route `PUBLISH` to every connection subscribed to the channel,
//! either exactly or through a glob pattern.
//!
//! ## Design Principles
//! 1. **Push Queues**: Each subscribed connection owns an unbounded queue;
//!    the broker only enqueues frames, the connection task writes them.
//! 2. **Both Kinds Fire**: A connection holding an exact and a matching
//!    pattern subscription receives a `message` and a `pmessage`.

use hashbrown::HashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use cachet_common::glob_match;

use crate::protocol::RespValue;

/// Outgoing frame queue of one connection.
pub type PushSender = mpsc::UnboundedSender<RespValue>;

type Subscribers = HashMap<Vec<u8>, HashMap<u64, PushSender>>;

#[derive(Debug, Default)]
pub struct Broker {
    channels: RwLock<Subscribers>,
    patterns: RwLock<Subscribers>,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, id: u64, channel: &[u8], push: &PushSender) {
        insert(&self.channels, id, channel, push);
    }

    pub fn psubscribe(&self, id: u64, pattern: &[u8], push: &PushSender) {
        insert(&self.patterns, id, pattern, push);
    }

    pub fn unsubscribe(&self, id: u64, channel: &[u8]) {
        remove(&self.channels, id, channel);
    }

    pub fn punsubscribe(&self, id: u64, pattern: &[u8]) {
        remove(&self.patterns, id, pattern);
    }

    /// Delivers `payload` and returns how many frames were enqueued.
    pub fn publish(&self, channel: &[u8], payload: &[u8]) -> usize {
        let mut delivered = 0;

        if let Some(subscribers) = self.channels.read().get(channel) {
            for push in subscribers.values() {
                let frame = RespValue::bulk_array([b"message".to_vec(), channel.to_vec(), payload.to_vec()]);
                if push.send(frame).is_ok() {
                    delivered += 1;
                }
            }
        }

        for (pattern, subscribers) in self.patterns.read().iter() {
            if !glob_match(pattern, channel) {
                continue;
            }
            for push in subscribers.values() {
                let frame = RespValue::bulk_array([
                    b"pmessage".to_vec(),
                    pattern.clone(),
                    channel.to_vec(),
                    payload.to_vec(),
                ]);
                if push.send(frame).is_ok() {
                    delivered += 1;
                }
            }
        }

        delivered
    }
}

fn insert(table: &RwLock<Subscribers>, id: u64, name: &[u8], push: &PushSender) {
    table
        .write()
        .entry(name.to_vec())
        .or_default()
        .insert(id, push.clone());
}

fn remove(table: &RwLock<Subscribers>, id: u64, name: &[u8]) {
    let mut table = table.write();
    let now_empty = match table.get_mut(name) {
        Some(subscribers) => {
            subscribers.remove(&id);
            subscribers.is_empty()
        }
        None => false,
    };
    if now_empty {
        table.remove(name);
    }
}
