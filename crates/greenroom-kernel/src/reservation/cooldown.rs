//! Cooldowns: minimum quiet period after a completed run.
//!
//! Each entry stores its own duration next to its timestamp, so overlapping
//! cooldowns with different lengths never interfere with each other.

use std::collections::HashMap;
use std::sync::Mutex;

use greenroom_core::ConvKey;
use tracing::{debug, trace};

/// Maximum tracked cooldown entries. At capacity, expired entries are pruned
/// first; if none are expired the oldest entry is evicted.
pub const MAX_COOLDOWN_ENTRIES: usize = 8_192;

/// Builds the cooldown key for an (episode, conversation) pair.
#[must_use]
pub fn cooldown_key(episode: &str, conv_key: &ConvKey) -> String {
    format!("{episode}::{conv_key}")
}

#[derive(Debug, Clone, Copy)]
struct CooldownEntry {
    set_at_ms: u64,
    duration_ms: u64,
}

impl CooldownEntry {
    fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.checked_sub(self.set_at_ms).is_some_and(|age| age >= self.duration_ms)
    }
}

/// Per-key "time since last completion" gate.
#[derive(Debug, Default)]
pub struct CooldownTracker {
    entries: Mutex<HashMap<String, CooldownEntry>>,
}

impl CooldownTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked entries (including lazily-expired ones).
    pub fn len(&self) -> usize {
        self.entries.lock().expect("lock poisoned").len()
    }

    /// Returns `true` if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Arms a cooldown for `key` lasting `duration_ms` from `now_ms`.
    pub fn set(&self, key: &str, duration_ms: u64, now_ms: u64) {
        let mut entries = self.entries.lock().expect("lock poisoned");

        if entries.len() >= MAX_COOLDOWN_ENTRIES && !entries.contains_key(key) {
            entries.retain(|_, entry| !entry.is_expired(now_ms));
            if entries.len() >= MAX_COOLDOWN_ENTRIES {
                if let Some(oldest) = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.set_at_ms)
                    .map(|(k, _)| k.clone())
                {
                    entries.remove(&oldest);
                    debug!(key = %oldest, "evicted oldest cooldown entry at capacity");
                }
            }
        }

        entries.insert(
            key.to_string(),
            CooldownEntry {
                set_at_ms: now_ms,
                duration_ms,
            },
        );
        trace!(key, duration_ms, "cooldown armed");
    }

    /// Returns `true` if `key` is still inside its window at `now_ms`.
    ///
    /// Expired entries are pruned on lookup. A missing entry is simply "not
    /// cooling"; this never fails.
    pub fn is_in_cooldown(&self, key: &str, now_ms: u64) -> bool {
        let mut entries = self.entries.lock().expect("lock poisoned");
        match entries.get(key) {
            Some(entry) if entry.is_expired(now_ms) => {
                entries.remove(key);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Milliseconds left in the window, if the key is cooling.
    pub fn remaining_ms(&self, key: &str, now_ms: u64) -> Option<u64> {
        let entries = self.entries.lock().expect("lock poisoned");
        let entry = entries.get(key)?;
        let elapsed = now_ms.checked_sub(entry.set_at_ms)?;
        entry.duration_ms.checked_sub(elapsed).filter(|r| *r > 0)
    }
}
