//! Intents and admission decisions.
//!
//! An [`Intent`] is a request to run a named episode for a set of
//! participants. The coordinator consumes it once and answers with a
//! [`Decision`]: admitted with a live ticket, merged into another request's
//! coalescing window, or refused with a [`RejectReason`].

use serde::{Deserialize, Serialize};

use crate::conv_key::ParticipantId;
use crate::episode::EpisodeResult;
use crate::ticket::TicketId;

/// Where an intent came from.
///
/// Manual intents bypass coalescing and cooldown: an operator or player who
/// explicitly asked for an episode gets an immediate admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentOrigin {
    /// Explicitly requested (operator tooling, manual trigger arming).
    Manual,
    /// Produced by an automatic trigger sampling world state.
    Automatic,
}

impl IntentOrigin {
    /// Returns `true` for manually originated intents.
    #[must_use]
    pub const fn is_manual(self) -> bool {
        matches!(self, Self::Manual)
    }
}

/// A request to run a named episode for a set of participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    /// Name of the episode (act) to run.
    pub episode: String,
    /// Participants involved; at least two distinct ids are required for
    /// admission.
    pub participants: Vec<ParticipantId>,
    /// Origin tag controlling coalescing and cooldown exemptions.
    pub origin: IntentOrigin,
    /// Optional scenario text seeding the episode content.
    pub scenario: Option<String>,
    /// Optional deterministic seed.
    pub seed: Option<u64>,
    /// Optional locale tag for generated text.
    pub locale: Option<String>,
}

impl Intent {
    /// Creates an automatic intent with no scenario, seed, or locale.
    pub fn automatic(episode: impl Into<String>, participants: Vec<ParticipantId>) -> Self {
        Self {
            episode: episode.into(),
            participants,
            origin: IntentOrigin::Automatic,
            scenario: None,
            seed: None,
            locale: None,
        }
    }

    /// Creates a manual intent with no scenario, seed, or locale.
    pub fn manual(episode: impl Into<String>, participants: Vec<ParticipantId>) -> Self {
        Self {
            origin: IntentOrigin::Manual,
            ..Self::automatic(episode, participants)
        }
    }

    /// Sets the scenario text.
    #[must_use]
    pub fn with_scenario(mut self, scenario: impl Into<String>) -> Self {
        self.scenario = Some(scenario.into());
        self
    }

    /// Sets the deterministic seed.
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Sets the locale tag.
    #[must_use]
    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }
}

/// Why an intent was refused admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Fewer than two distinct participants after normalization.
    TooFewParticipants,
    /// The conversation key or a participant is already held by a live
    /// ticket, or the kernel is saturated.
    ConflictOrBusy,
    /// The (episode, conversation) pair is still inside its cooldown window.
    Cooling,
}

impl RejectReason {
    /// Stable string identifier for logs and diagnostics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TooFewParticipants => "too_few_participants",
            Self::ConflictOrBusy => "conflict_or_busy",
            Self::Cooling => "cooling",
        }
    }
}

/// Admission verdict for a submitted intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    /// Admitted; execution has been dispatched (or a cached result is
    /// attached).
    Approved,
    /// Merged into another concurrent submission's coalescing window.
    Coalesced,
    /// Refused.
    Rejected(RejectReason),
}

/// The coordinator's answer to [`Intent`] submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// The admission verdict.
    pub outcome: DecisionOutcome,
    /// The ticket backing an approval. For idempotency hits this is a
    /// synthetic id that was never registered with the kernel and needs no
    /// release.
    pub ticket: Option<TicketId>,
    /// Cached episode result attached when the request's fingerprint hit
    /// the idempotency cache.
    pub cached: Option<EpisodeResult>,
}

impl Decision {
    /// An approval backed by a live ticket.
    #[must_use]
    pub const fn approved(ticket: TicketId) -> Self {
        Self {
            outcome: DecisionOutcome::Approved,
            ticket: Some(ticket),
            cached: None,
        }
    }

    /// An approval answered from the idempotency cache.
    #[must_use]
    pub const fn approved_cached(ticket: TicketId, result: EpisodeResult) -> Self {
        Self {
            outcome: DecisionOutcome::Approved,
            ticket: Some(ticket),
            cached: Some(result),
        }
    }

    /// A merge into another submission's window.
    #[must_use]
    pub const fn coalesced() -> Self {
        Self {
            outcome: DecisionOutcome::Coalesced,
            ticket: None,
            cached: None,
        }
    }

    /// A refusal.
    #[must_use]
    pub const fn rejected(reason: RejectReason) -> Self {
        Self {
            outcome: DecisionOutcome::Rejected(reason),
            ticket: None,
            cached: None,
        }
    }

    /// Returns `true` if the intent was admitted.
    #[must_use]
    pub const fn is_approved(&self) -> bool {
        matches!(self.outcome, DecisionOutcome::Approved)
    }

    /// Returns `true` if the intent was merged into another window.
    #[must_use]
    pub const fn is_coalesced(&self) -> bool {
        matches!(self.outcome, DecisionOutcome::Coalesced)
    }
}
