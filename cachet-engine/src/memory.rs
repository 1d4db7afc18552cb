//! # In-Memory Engine
//!
//! Provide the in-memory backend with sharded locking, typed values, and
//! TTL-aware lookups.
//!
//! ## Usage
//!
//! - Use `MemoryEngine::new()` for a default sharded engine.
//! - Use `MemoryEngine::with_shard_count` to pin the shard count in tests.
//! - Call `purge_expired` periodically for active TTL cleanup.
//!
//! ## Design Principles
//!
//! 1. **Sharded Locks**: Per-shard locks reduce contention under concurrency.
//! 2. **Typed Values**: Strings, sets, and sorted sets share one keyspace;
//!    touching a key as the wrong type fails instead of converting it.
//! 3. **Arc-backed Strings**: String values are `Arc<[u8]>` so reads do not
//!    copy the payload while the shard lock is held.
//! 4. **TTL Fast Path**: Expiration is checked on access, so expired keys
//!    are never observed even without a periodic sweep.
//! 5. **Strategy Pattern**: Implements `KVEngine` to keep callers decoupled.
//!
//! ## Structure Overview
//!
//! ```text
//! MemoryEngine
//!   └── shards: Vec<Shard>
//!         └── Shard
//!               └── inner: RwLock<ShardInner>
//!                     └── map: HashMap<Vec<u8>, Entry>
//!                           └── Entry { value, expires_at }
//!                                 └── Value::{String, Set, SortedSet}
//!                                       SortedSet { scores, order: BTreeSet<(Score, member)> }
//! ```

use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeSet;
use std::hash::{BuildHasher, Hasher};
use std::ops::Bound;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::RandomState;
use hashbrown::{HashMap, HashSet};
use parking_lot::RwLock;

use cachet_common::{StoreError, StoreResult, Ttl};

use crate::engine::KVEngine;

/// Default shards = CPU count * multiplier to reduce lock contention.
const DEFAULT_SHARD_MULTIPLIER: usize = 4;

type MemberSet = HashSet<Vec<u8>, RandomState>;

/// Sorted-set score with a total order.
///
/// NaN never reaches the engine (the server rejects it), and `-0.0` is
/// folded into `0.0` on the way in so equal scores compare equal.
#[derive(Debug, Clone, Copy)]
struct Score(f64);

impl Score {
    fn new(score: f64) -> Self {
        Score(if score == 0.0 { 0.0 } else { score })
    }
}

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.0.total_cmp(&other.0)
    }
}

/// Member -> score index plus a (score, member) ordering for range scans.
#[derive(Debug, Default)]
struct SortedSet {
    scores: HashMap<Vec<u8>, Score, RandomState>,
    order: BTreeSet<(Score, Vec<u8>)>,
}

impl SortedSet {
    /// Inserts or re-scores `member`. Returns true when it was new.
    fn insert(&mut self, member: Vec<u8>, score: f64) -> bool {
        let score = Score::new(score);
        match self.scores.insert(member.clone(), score) {
            Some(previous) => {
                self.order.remove(&(previous, member.clone()));
                self.order.insert((score, member));
                false
            }
            None => {
                self.order.insert((score, member));
                true
            }
        }
    }

    /// Members with `min <= score <= max`, ascending by (score, member).
    fn range(&self, min: f64, max: f64) -> impl Iterator<Item = &Vec<u8>> + '_ {
        let max = Score::new(max);
        let start = (Score::new(min), Vec::new());
        self.order
            .range((Bound::Included(start), Bound::Unbounded))
            .take_while(move |(score, _)| *score <= max)
            .map(|(_, member)| member)
    }

    fn remove_range(&mut self, min: f64, max: f64) -> usize {
        let doomed: Vec<Vec<u8>> = self.range(min, max).cloned().collect();
        for member in &doomed {
            if let Some(score) = self.scores.remove(member) {
                self.order.remove(&(score, member.clone()));
            }
        }
        doomed.len()
    }

    fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

#[derive(Debug)]
enum Value {
    String(Arc<[u8]>),
    Set(MemberSet),
    SortedSet(SortedSet),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::String(_) => "string",
            Value::Set(_) => "set",
            Value::SortedSet(_) => "zset",
        }
    }
}

/// A stored value and its absolute expiration.
#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Entry {
            value,
            expires_at: None,
        }
    }

    /// Returns true when the entry has expired at `now`.
    fn is_expired(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }
}

/// Per-shard storage container.
///
/// Every accessor drops an expired entry before looking at it, so callers
/// only ever see live keys.
#[derive(Debug)]
struct ShardInner {
    map: HashMap<Vec<u8>, Entry, RandomState>,
}

impl ShardInner {
    fn new(hash_state: RandomState) -> Self {
        ShardInner {
            map: HashMap::with_hasher(hash_state),
        }
    }

    /// Live entry for `key`, removing it first if it expired.
    fn live(&mut self, key: &[u8], now: Instant) -> Option<&mut Entry> {
        let expired = self.map.get(key)?.is_expired(now);
        if expired {
            self.map.remove(key);
            return None;
        }
        self.map.get_mut(key)
    }

    /// Removes and returns the live entry for `key`.
    fn take_live(&mut self, key: &[u8], now: Instant) -> Option<Entry> {
        self.map.remove(key).filter(|entry| !entry.is_expired(now))
    }

    fn members(&mut self, key: &[u8], now: Instant) -> StoreResult<Option<&mut MemberSet>> {
        match self.live(key, now) {
            None => Ok(None),
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => Ok(Some(set)),
            Some(_) => Err(StoreError::WrongType),
        }
    }

    fn members_or_insert(&mut self, key: &[u8], now: Instant) -> StoreResult<&mut MemberSet> {
        self.live(key, now);
        let entry = self
            .map
            .entry(key.to_vec())
            .or_insert_with(|| Entry::new(Value::Set(MemberSet::default())));
        match &mut entry.value {
            Value::Set(set) => Ok(set),
            _ => Err(StoreError::WrongType),
        }
    }

    fn sorted(&mut self, key: &[u8], now: Instant) -> StoreResult<Option<&mut SortedSet>> {
        match self.live(key, now) {
            None => Ok(None),
            Some(Entry {
                value: Value::SortedSet(sorted),
                ..
            }) => Ok(Some(sorted)),
            Some(_) => Err(StoreError::WrongType),
        }
    }

    fn sorted_or_insert(&mut self, key: &[u8], now: Instant) -> StoreResult<&mut SortedSet> {
        self.live(key, now);
        let entry = self
            .map
            .entry(key.to_vec())
            .or_insert_with(|| Entry::new(Value::SortedSet(SortedSet::default())));
        match &mut entry.value {
            Value::SortedSet(sorted) => Ok(sorted),
            _ => Err(StoreError::WrongType),
        }
    }

    /// Drops a collection key once its last member is gone.
    fn remove_if_empty(&mut self, key: &[u8]) {
        let empty = match self.map.get(key).map(|entry| &entry.value) {
            Some(Value::Set(set)) => set.is_empty(),
            Some(Value::SortedSet(sorted)) => sorted.is_empty(),
            _ => false,
        };
        if empty {
            self.map.remove(key);
        }
    }
}

/// Per-shard lock wrapper.
#[derive(Debug)]
struct Shard {
    inner: RwLock<ShardInner>,
}

/// Sharded in-memory implementation of `KVEngine`.
#[derive(Debug)]
pub struct MemoryEngine {
    /// Per-shard storage.
    shards: Vec<Shard>,
    /// Bitmask for fast shard selection (power-of-two shard count).
    shard_mask: usize,
    /// Hash state used to pick shards deterministically.
    hash_state: RandomState,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    /// Creates a new engine with a default shard count based on CPU parallelism.
    pub fn new() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1);
        Self::with_shard_count(threads.saturating_mul(DEFAULT_SHARD_MULTIPLIER))
    }

    /// Creates a new engine with a caller-provided shard count.
    ///
    /// The count is normalized to the next power of two to enable fast masking.
    pub fn with_shard_count(shards: usize) -> Self {
        let shard_count = normalize_shard_count(shards);
        let hash_state = RandomState::new();
        let shards = (0..shard_count)
            .map(|_| Shard {
                inner: RwLock::new(ShardInner::new(hash_state.clone())),
            })
            .collect();

        MemoryEngine {
            shards,
            shard_mask: shard_count - 1,
            hash_state,
        }
    }

    /// Number of live keys across all shards.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.shards
            .iter()
            .map(|shard| {
                let inner = shard.inner.read();
                inner.map.values().filter(|entry| !entry.is_expired(now)).count()
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes expired entries across all shards.
    ///
    /// This is an O(n) scan and is intended for a periodic background sweep.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut inner = shard.inner.write();
            let before = inner.map.len();
            inner.map.retain(|_, entry| !entry.is_expired(now));
            removed += before - inner.map.len();
        }
        removed
    }

    /// Hashes a key to its owning shard index.
    fn shard_index(&self, key: &[u8]) -> usize {
        let mut hasher = self.hash_state.build_hasher();
        hasher.write(key);
        (hasher.finish() as usize) & self.shard_mask
    }

    /// Returns the shard responsible for a given key.
    fn shard_for(&self, key: &[u8]) -> &Shard {
        &self.shards[self.shard_index(key)]
    }
}

impl KVEngine for MemoryEngine {
    fn get(&self, key: &[u8]) -> StoreResult<Option<Arc<[u8]>>> {
        let mut inner = self.shard_for(key).inner.write();
        match inner.live(key, Instant::now()) {
            None => Ok(None),
            Some(Entry {
                value: Value::String(value),
                ..
            }) => Ok(Some(Arc::clone(value))),
            Some(_) => Err(StoreError::WrongType),
        }
    }

    /// Inserts or replaces a string value, dropping any previous TTL.
    ///
    /// A TTL too large to represent is treated as no expiration.
    fn set(&self, key: Vec<u8>, value: Vec<u8>, ttl: Option<Duration>) -> StoreResult<()> {
        let now = Instant::now();
        let mut inner = self.shard_for(&key).inner.write();
        inner.map.insert(
            key,
            Entry {
                value: Value::String(Arc::from(value)),
                expires_at: ttl.and_then(|ttl| now.checked_add(ttl)),
            },
        );
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> StoreResult<bool> {
        let mut inner = self.shard_for(key).inner.write();
        Ok(inner.take_live(key, Instant::now()).is_some())
    }

    fn exists(&self, key: &[u8]) -> StoreResult<bool> {
        let mut inner = self.shard_for(key).inner.write();
        Ok(inner.live(key, Instant::now()).is_some())
    }

    fn key_type(&self, key: &[u8]) -> StoreResult<Option<&'static str>> {
        let mut inner = self.shard_for(key).inner.write();
        Ok(inner.live(key, Instant::now()).map(|entry| entry.value.kind()))
    }

    fn expire(&self, key: &[u8], ttl: Duration) -> StoreResult<bool> {
        let now = Instant::now();
        let mut inner = self.shard_for(key).inner.write();
        match inner.live(key, now) {
            Some(entry) => {
                entry.expires_at = now.checked_add(ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn persist(&self, key: &[u8]) -> StoreResult<bool> {
        let mut inner = self.shard_for(key).inner.write();
        Ok(inner
            .live(key, Instant::now())
            .map(|entry| entry.expires_at.take().is_some())
            .unwrap_or(false))
    }

    /// Locks both shards in index order so concurrent renames cannot deadlock.
    fn rename(&self, key: &[u8], new_key: Vec<u8>) -> StoreResult<()> {
        let now = Instant::now();
        let (from, to) = (self.shard_index(key), self.shard_index(&new_key));

        if from == to {
            let mut inner = self.shards[from].inner.write();
            let entry = inner.take_live(key, now).ok_or(StoreError::NotFound)?;
            inner.map.insert(new_key, entry);
            return Ok(());
        }

        let (mut source, mut target) = if from < to {
            let source = self.shards[from].inner.write();
            (source, self.shards[to].inner.write())
        } else {
            let target = self.shards[to].inner.write();
            (self.shards[from].inner.write(), target)
        };
        let entry = source.take_live(key, now).ok_or(StoreError::NotFound)?;
        target.map.insert(new_key, entry);
        Ok(())
    }

    fn ttl(&self, key: &[u8]) -> StoreResult<Ttl> {
        let now = Instant::now();
        let mut inner = self.shard_for(key).inner.write();
        Ok(match inner.live(key, now) {
            None => Ttl::Missing,
            Some(entry) => match entry.expires_at {
                None => Ttl::NoExpiry,
                Some(deadline) => Ttl::ExpiresIn(deadline.saturating_duration_since(now)),
            },
        })
    }

    fn sadd(&self, key: &[u8], members: Vec<Vec<u8>>) -> StoreResult<usize> {
        let mut inner = self.shard_for(key).inner.write();
        let set = inner.members_or_insert(key, Instant::now())?;
        Ok(members.into_iter().filter(|member| set.insert(member.clone())).count())
    }

    fn srem(&self, key: &[u8], members: &[Vec<u8>]) -> StoreResult<usize> {
        let mut inner = self.shard_for(key).inner.write();
        let removed = match inner.members(key, Instant::now())? {
            Some(set) => members.iter().filter(|member| set.remove(*member)).count(),
            None => return Ok(0),
        };
        inner.remove_if_empty(key);
        Ok(removed)
    }

    fn sismember(&self, key: &[u8], member: &[u8]) -> StoreResult<bool> {
        let mut inner = self.shard_for(key).inner.write();
        Ok(inner
            .members(key, Instant::now())?
            .map(|set| set.contains(member))
            .unwrap_or(false))
    }

    fn smembers(&self, key: &[u8]) -> StoreResult<Vec<Vec<u8>>> {
        let mut inner = self.shard_for(key).inner.write();
        Ok(inner
            .members(key, Instant::now())?
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn zadd(&self, key: &[u8], score: f64, member: Vec<u8>) -> StoreResult<bool> {
        if score.is_nan() {
            return Err(StoreError::NotAFloat);
        }
        let mut inner = self.shard_for(key).inner.write();
        Ok(inner.sorted_or_insert(key, Instant::now())?.insert(member, score))
    }

    fn zrange_by_score(
        &self,
        key: &[u8],
        min: f64,
        max: f64,
        limit: Option<(usize, usize)>,
    ) -> StoreResult<Vec<Vec<u8>>> {
        let mut inner = self.shard_for(key).inner.write();
        let sorted = match inner.sorted(key, Instant::now())? {
            Some(sorted) => sorted,
            None => return Ok(Vec::new()),
        };
        let (offset, count) = limit.unwrap_or((0, usize::MAX));
        Ok(sorted
            .range(min, max)
            .skip(offset)
            .take(count)
            .cloned()
            .collect())
    }

    fn zrem_range_by_score(&self, key: &[u8], min: f64, max: f64) -> StoreResult<usize> {
        let mut inner = self.shard_for(key).inner.write();
        let removed = match inner.sorted(key, Instant::now())? {
            Some(sorted) => sorted.remove_range(min, max),
            None => return Ok(0),
        };
        inner.remove_if_empty(key);
        Ok(removed)
    }
}

/// Normalizes shard counts to a power of two for fast masking.
fn normalize_shard_count(count: usize) -> usize {
    count.max(1).next_power_of_two()
}
