//! Error types shared across the workspace.

use thiserror::Error;

use crate::conv_key::{ConvKey, ParticipantId};
use crate::ticket::TicketId;

/// Why a reservation was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ReserveRefused {
    /// The conversation key is already held by a live ticket.
    #[error("conversation {conv_key} is already held by {holder}")]
    ConvKeyBusy {
        /// The contested conversation key.
        conv_key: ConvKey,
        /// The ticket currently holding it.
        holder: TicketId,
    },

    /// A participant in the claim is already held by another ticket.
    #[error("participant {participant} is already held by {holder}")]
    ParticipantBusy {
        /// The contested participant.
        participant: ParticipantId,
        /// The ticket currently holding them.
        holder: TicketId,
    },

    /// The kernel is at its active-ticket capacity.
    #[error("reservation kernel is saturated ({active} active tickets)")]
    Saturated {
        /// Active tickets at refusal time.
        active: usize,
    },
}

impl ReserveRefused {
    /// Stable string identifier for logs and diagnostics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ConvKeyBusy { .. } => "conv_key_busy",
            Self::ParticipantBusy { .. } => "participant_busy",
            Self::Saturated { .. } => "saturated",
        }
    }
}

/// Errors from lease mutation (`extend_lease` / `release`).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum LeaseError {
    /// No live ticket with this id.
    #[error("ticket not found: {ticket_id}")]
    TicketNotFound {
        /// The missing ticket id.
        ticket_id: TicketId,
    },

    /// Operation on a ticket in a terminal state.
    #[error("{ticket_id} is already in terminal state: {current_state}")]
    TicketAlreadyTerminal {
        /// The ticket id.
        ticket_id: TicketId,
        /// Its terminal state.
        current_state: &'static str,
    },

    /// A renewal must move the expiry forward.
    #[error(
        "renewal for {ticket_id} must extend the lease: current={current_expires_at_ms}, new={new_expires_at_ms}"
    )]
    RenewalDoesNotExtend {
        /// The ticket id.
        ticket_id: TicketId,
        /// Current expiry (ms since epoch).
        current_expires_at_ms: u64,
        /// Attempted new expiry (ms since epoch).
        new_expires_at_ms: u64,
    },
}

/// Invalid configuration detected at composition time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// `max_tasks_per_step` is zero; the scheduler would never drain.
    #[error("max_tasks_per_step must be at least 1")]
    ZeroTaskCeiling,

    /// `reservation_ttl_ms` is zero; every ticket would be born expired.
    #[error("reservation_ttl_ms must be nonzero")]
    ZeroReservationTtl,

    /// The heartbeat cannot keep a lease alive if it fires slower than the
    /// lease lapses.
    #[error(
        "heartbeat_interval_ms ({heartbeat_interval_ms}) must be shorter than reservation_ttl_ms ({reservation_ttl_ms})"
    )]
    HeartbeatSlowerThanLease {
        /// Configured heartbeat interval.
        heartbeat_interval_ms: u64,
        /// Configured lease length.
        reservation_ttl_ms: u64,
    },

    /// A periodic interval of zero steps would fire every frame.
    #[error("periodic step intervals must be nonzero")]
    ZeroPeriodicInterval,
}

/// Errors detected while wiring the stage at composition time.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CompositionError {
    /// Two acts registered under the same episode name.
    #[error("duplicate act registered: {name}")]
    DuplicateAct {
        /// The contested name.
        name: String,
    },

    /// Two triggers registered under the same name.
    #[error("duplicate trigger registered: {name}")]
    DuplicateTrigger {
        /// The contested name.
        name: String,
    },

    /// A trigger targets an episode no act implements.
    #[error("trigger {trigger} targets unknown episode {episode}")]
    UnknownTargetEpisode {
        /// The offending trigger.
        trigger: String,
        /// The missing episode name.
        episode: String,
    },

    /// Registry capacity exceeded.
    #[error("registry capacity exceeded: at most {max} {what} allowed")]
    RegistryFull {
        /// What overflowed ("acts" or "triggers").
        what: &'static str,
        /// The capacity.
        max: usize,
    },

    /// The configuration failed validation.
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
}
