//! Coalescing of near-simultaneous requests.
//!
//! When several triggers notice the same conversation opportunity within a
//! few frames of each other, only one of the resulting requests should go on
//! to admission. Every caller for a conversation key waits until the window
//! that opened with the first caller has elapsed, then races a single-entry
//! gate; the winner runs the leader work and proceeds, the rest report back
//! that they were merged.
//!
//! # Bucket lifecycle
//!
//! A bucket exists only while requests for its key are arriving inside the
//! window. Once the gate has been decided (or the window deadline has
//! passed), the bucket is stale: the winner removes it, and any later caller
//! that still finds it replaces it with a fresh one, opening a new window.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use greenroom_core::ConvKey;
use tokio::time::Instant;
use tracing::{trace, warn};

/// Maximum concurrent coalescing buckets.
///
/// At capacity a new key skips coalescing entirely (its caller proceeds as
/// leader immediately); admission never blocks on this map being full.
pub const MAX_COALESCE_BUCKETS: usize = 1_024;

#[derive(Debug)]
struct Bucket {
    opened_at: Instant,
    window: Duration,
    claimed: AtomicBool,
}

impl Bucket {
    fn deadline(&self) -> Instant {
        self.opened_at + self.window
    }

    fn is_stale(&self, now: Instant) -> bool {
        self.claimed.load(Ordering::SeqCst) || now >= self.deadline()
    }
}

/// Per-conversation-key request deduplication windows.
#[derive(Debug, Default)]
pub struct Coalescer {
    buckets: Mutex<HashMap<ConvKey, Arc<Bucket>>>,
}

impl Coalescer {
    /// Creates an empty coalescer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of open buckets.
    pub fn len(&self) -> usize {
        self.buckets.lock().expect("lock poisoned").len()
    }

    /// Returns `true` if no windows are open.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Joins (or opens) the window for `conv_key` and races for leadership.
    ///
    /// Suspends for the remainder of the window measured from the *first*
    /// caller, then exactly one caller wins the gate, runs `leader_work`,
    /// and gets `true`; every other caller gets `false` without running its
    /// work.
    pub async fn coalesce_within<F>(&self, conv_key: &ConvKey, window_ms: u64, leader_work: F) -> bool
    where
        F: FnOnce(),
    {
        let now = Instant::now();
        let bucket = {
            let mut buckets = self.buckets.lock().expect("lock poisoned");

            let fresh_needed = match buckets.get(conv_key) {
                Some(existing) => existing.is_stale(now),
                None => true,
            };
            if fresh_needed {
                if buckets.len() >= MAX_COALESCE_BUCKETS && !buckets.contains_key(conv_key) {
                    warn!(
                        conv_key = %conv_key,
                        open = buckets.len(),
                        "coalescer saturated; proceeding without window"
                    );
                    drop(buckets);
                    leader_work();
                    return true;
                }
                let bucket = Arc::new(Bucket {
                    opened_at: now,
                    window: Duration::from_millis(window_ms),
                    claimed: AtomicBool::new(false),
                });
                buckets.insert(conv_key.clone(), Arc::clone(&bucket));
                trace!(conv_key = %conv_key, window_ms, "opened coalescing window");
                bucket
            } else {
                Arc::clone(buckets.get(conv_key).expect("bucket checked above"))
            }
        };

        tokio::time::sleep_until(bucket.deadline()).await;

        let won = !bucket.claimed.swap(true, Ordering::SeqCst);
        if won {
            // The winner retires the bucket; a stale bucket left behind is
            // replaced on the next call anyway.
            let mut buckets = self.buckets.lock().expect("lock poisoned");
            if let Some(current) = buckets.get(conv_key) {
                if Arc::ptr_eq(current, &bucket) {
                    buckets.remove(conv_key);
                }
            }
            drop(buckets);
            trace!(conv_key = %conv_key, "won coalescing gate");
            leader_work();
        } else {
            trace!(conv_key = %conv_key, "merged into coalescing window");
        }
        won
    }
}
