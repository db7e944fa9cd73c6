//! Idempotency cache: time-boxed result memoization.
//!
//! A second request with an identical fingerprint within the TTL is answered
//! from here without re-reserving or re-executing. Entries expire by TTL and
//! the cache is bounded: at capacity the oldest insertion is evicted first.
//!
//! The insertion-order queue can hold stale entries for keys that were
//! overwritten or pruned; eviction detects those by comparing the stored
//! insertion timestamp against the live entry and skips them.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use greenroom_core::{EpisodeResult, Fingerprint};
use tracing::{debug, trace};

/// Maximum cached results.
pub const MAX_IDEMPOTENCY_ENTRIES: usize = 1_024;

#[derive(Debug, Clone)]
struct CacheEntry {
    result: EpisodeResult,
    completed_at_ms: u64,
    ttl_ms: u64,
    hits: u64,
}

impl CacheEntry {
    fn is_expired(&self, now_ms: u64) -> bool {
        now_ms
            .checked_sub(self.completed_at_ms)
            .is_some_and(|age| age >= self.ttl_ms)
    }
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<Fingerprint, CacheEntry>,
    /// Insertion order for eviction; may contain stale (overwritten) keys,
    /// detected by timestamp mismatch.
    order: VecDeque<(Fingerprint, u64)>,
}

/// Statistics snapshot for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdempotencyStats {
    /// Live entries.
    pub entries: usize,
    /// Total lookup hits since start.
    pub hits: u64,
}

/// Bounded TTL cache of episode results keyed by request fingerprint.
#[derive(Debug, Default)]
pub struct IdempotencyCache {
    state: Mutex<CacheState>,
    hits: std::sync::atomic::AtomicU64,
}

impl IdempotencyCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Live entry count.
    pub fn len(&self) -> usize {
        self.state.lock().expect("lock poisoned").entries.len()
    }

    /// Returns `true` if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up a cached result. Expired entries are pruned on lookup; a
    /// missing entry is simply a miss.
    pub fn get(&self, fingerprint: &Fingerprint, now_ms: u64) -> Option<EpisodeResult> {
        let mut state = self.state.lock().expect("lock poisoned");
        match state.entries.get_mut(fingerprint) {
            Some(entry) if entry.is_expired(now_ms) => {
                state.entries.remove(fingerprint);
                trace!(fingerprint = %fingerprint, "idempotency entry expired");
                None
            }
            Some(entry) => {
                entry.hits += 1;
                self.hits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                trace!(fingerprint = %fingerprint, hits = entry.hits, "idempotency hit");
                Some(entry.result.clone())
            }
            None => None,
        }
    }

    /// Caches a result for `ttl_ms` from `now_ms`.
    pub fn set(&self, fingerprint: Fingerprint, result: EpisodeResult, ttl_ms: u64, now_ms: u64) {
        let mut state = self.state.lock().expect("lock poisoned");

        state.entries.retain(|_, entry| !entry.is_expired(now_ms));
        while state.entries.len() >= MAX_IDEMPOTENCY_ENTRIES {
            if !evict_oldest(&mut state) {
                break;
            }
        }

        state.entries.insert(
            fingerprint.clone(),
            CacheEntry {
                result,
                completed_at_ms: now_ms,
                ttl_ms,
                hits: 0,
            },
        );
        state.order.push_back((fingerprint.clone(), now_ms));
        debug!(fingerprint = %fingerprint, ttl_ms, "cached episode result");
    }

    /// Drops every entry.
    pub fn clear(&self) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.entries.clear();
        state.order.clear();
        debug!("cleared idempotency cache");
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> IdempotencyStats {
        IdempotencyStats {
            entries: self.len(),
            hits: self.hits.load(std::sync::atomic::Ordering::Relaxed),
        }
    }
}

/// Pops insertion-order entries until one matches a live cache entry and
/// evicts it. Returns `false` if the queue ran dry.
fn evict_oldest(state: &mut CacheState) -> bool {
    while let Some((fingerprint, inserted_at_ms)) = state.order.pop_front() {
        let live = state
            .entries
            .get(&fingerprint)
            .is_some_and(|entry| entry.completed_at_ms == inserted_at_ms);
        if live {
            state.entries.remove(&fingerprint);
            trace!(fingerprint = %fingerprint, "evicted oldest idempotency entry");
            return true;
        }
        // Stale queue entry for an overwritten or pruned key; skip it.
    }
    false
}
