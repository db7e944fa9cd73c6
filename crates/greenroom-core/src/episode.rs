//! Episode execution contract types.
//!
//! An [`EpisodeRequest`] is what the coordinator hands a registered act once
//! a reservation is granted; an [`EpisodeResult`] is what comes back. A
//! result is always materialized: a missing or faulted execution is
//! normalized into `completed = false` with a safe placeholder text, never a
//! fault crossing the coordinator boundary.

use serde::{Deserialize, Serialize};

use crate::conv_key::{ConvKey, ParticipantId};
use crate::ticket::TicketId;

/// Safe user-displayable text substituted when an episode produced nothing.
pub const FALLBACK_TEXT: &str = "…";

/// How an episode run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeReason {
    /// The act ran to completion.
    Completed,
    /// No act is registered under the requested episode name.
    ActNotFound,
    /// The act declined eligibility for this request.
    Rejected,
    /// The hard per-episode deadline elapsed before the act returned.
    Timeout,
    /// The act faulted (returned an error or panicked).
    Exception,
}

impl EpisodeReason {
    /// Stable string identifier for logs and diagnostics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::ActNotFound => "act_not_found",
            Self::Rejected => "rejected",
            Self::Timeout => "timeout",
            Self::Exception => "exception",
        }
    }
}

/// Everything an act needs to run one episode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeRequest {
    /// The ticket authorizing this run. Acts must not retain it past their
    /// own return.
    pub ticket_id: TicketId,
    /// Episode name the request was routed under.
    pub episode: String,
    /// Conversation key held for this run.
    pub conv_key: ConvKey,
    /// Normalized participant roster.
    pub participants: Vec<ParticipantId>,
    /// Optional scenario text.
    pub scenario: Option<String>,
    /// Optional deterministic seed.
    pub seed: Option<u64>,
    /// Optional locale tag.
    pub locale: Option<String>,
}

/// Outcome of one episode run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeResult {
    /// `true` only for [`EpisodeReason::Completed`].
    pub completed: bool,
    /// How the run ended.
    pub reason: EpisodeReason,
    /// Final text. Failure paths carry [`FALLBACK_TEXT`] unless the act
    /// supplied something better before failing.
    pub text: String,
    /// Wall time from dispatch to result, in milliseconds.
    pub latency_ms: u64,
}

impl EpisodeResult {
    /// A successful run.
    pub fn completed(text: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            completed: true,
            reason: EpisodeReason::Completed,
            text: text.into(),
            latency_ms,
        }
    }

    /// A failure, normalized with the safe placeholder text.
    #[must_use]
    pub fn failed(reason: EpisodeReason, latency_ms: u64) -> Self {
        debug_assert!(reason != EpisodeReason::Completed);
        Self {
            completed: false,
            reason,
            text: FALLBACK_TEXT.to_string(),
            latency_ms,
        }
    }
}
