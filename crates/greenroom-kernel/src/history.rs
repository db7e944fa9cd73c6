//! Episode history recording.
//!
//! A write-only collaborator receiving each finished run. Recording is
//! best-effort: the coordinator logs and swallows sink failures, so a broken
//! sink can never fail an episode.

use std::collections::VecDeque;
use std::sync::Mutex;

use greenroom_core::{ConvKey, EpisodeResult};
use thiserror::Error;

/// Default capacity of the in-memory ring sink.
pub const DEFAULT_HISTORY_CAPACITY: usize = 256;

/// One recorded run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    /// Episode name.
    pub episode: String,
    /// Conversation the run was held for.
    pub conv_key: ConvKey,
    /// The outcome.
    pub result: EpisodeResult,
    /// When the record was written (ms since epoch).
    pub recorded_at_ms: u64,
}

/// Failure writing to a history sink.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum HistoryError {
    /// The sink could not accept the record.
    #[error("history sink unavailable: {reason}")]
    Unavailable {
        /// Sink-specific reason.
        reason: String,
    },
}

/// Write-only recording collaborator.
pub trait HistorySink: Send + Sync {
    /// Records one finished run.
    fn record(&self, entry: HistoryEntry) -> Result<(), HistoryError>;
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHistory;

impl HistorySink for NullHistory {
    fn record(&self, _entry: HistoryEntry) -> Result<(), HistoryError> {
        Ok(())
    }
}

/// Bounded in-memory ring of recent runs.
#[derive(Debug)]
pub struct MemoryHistory {
    entries: Mutex<VecDeque<HistoryEntry>>,
    capacity: usize,
}

impl MemoryHistory {
    /// Creates a ring holding at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY_CAPACITY))),
            capacity: capacity.max(1),
        }
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("lock poisoned").len()
    }

    /// Returns `true` if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The most recent `n` entries, newest first.
    pub fn recent(&self, n: usize) -> Vec<HistoryEntry> {
        let entries = self.entries.lock().expect("lock poisoned");
        entries.iter().rev().take(n).cloned().collect()
    }
}

impl Default for MemoryHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl HistorySink for MemoryHistory {
    fn record(&self, entry: HistoryEntry) -> Result<(), HistoryError> {
        let mut entries = self.entries.lock().expect("lock poisoned");
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
        Ok(())
    }
}
