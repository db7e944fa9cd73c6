//! Tickets: time-bounded exclusive-access leases.
//!
//! A [`Ticket`] grants exclusive access to a conversation key and every
//! participant it names until it is released or its lease expires.
//!
//! # State Machine
//!
//! ```text
//! Reserved ──(renewed)*──► Reserved ──release──► Released
//!     │
//!     └──(no renewal before expiry)──► Expired
//! ```
//!
//! Terminal states have no outgoing transitions; the kernel removes terminal
//! tickets from every index.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::conv_key::{ConvKey, ParticipantId};
use crate::error::LeaseError;

/// Identifier of a ticket, issued from a monotonic counter.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TicketId(u64);

impl TicketId {
    /// Wraps a raw counter value.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw counter value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ticket-{}", self.0)
    }
}

/// Lifecycle state of a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketState {
    /// Live: the conversation key and participants are held.
    Reserved,
    /// Released by its owner (or force-released by diagnostics).
    Released,
    /// Force-released after its lease lapsed without renewal.
    Expired,
}

impl TicketState {
    /// Returns `true` for states with no outgoing transitions.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Released | Self::Expired)
    }

    /// Stable string identifier for logs and diagnostics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::Released => "released",
            Self::Expired => "expired",
        }
    }
}

/// A reservation request consumed by the kernel's `try_reserve`.
///
/// Not retained after the call: on success its contents move into the issued
/// [`Ticket`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceClaim {
    /// Conversation key the claim wants to hold.
    pub conv_key: ConvKey,
    /// Normalized participant roster.
    pub participants: Vec<ParticipantId>,
    /// Exclusive claims additionally require every participant to be free;
    /// non-exclusive claims only contend on the conversation key.
    pub exclusive: bool,
}

impl ResourceClaim {
    /// Creates an exclusive claim, the only kind the coordinator issues.
    #[must_use]
    pub const fn exclusive(conv_key: ConvKey, participants: Vec<ParticipantId>) -> Self {
        Self {
            conv_key,
            participants,
            exclusive: true,
        }
    }
}

/// A time-bounded exclusive-access grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    /// Ticket identifier.
    pub id: TicketId,
    /// Conversation key this ticket holds.
    pub conv_key: ConvKey,
    /// Participants this ticket holds.
    pub participants: Vec<ParticipantId>,
    /// Current lifecycle state.
    pub state: TicketState,
    /// When the ticket was issued (ms since epoch).
    pub issued_at_ms: u64,
    /// When the lease lapses unless renewed (ms since epoch).
    pub expires_at_ms: u64,
    /// How many times the lease has been renewed.
    pub renewal_count: u32,
}

impl Ticket {
    /// Creates a freshly reserved ticket.
    #[must_use]
    pub const fn new(
        id: TicketId,
        conv_key: ConvKey,
        participants: Vec<ParticipantId>,
        issued_at_ms: u64,
        expires_at_ms: u64,
    ) -> Self {
        Self {
            id,
            conv_key,
            participants,
            state: TicketState::Reserved,
            issued_at_ms,
            expires_at_ms,
            renewal_count: 0,
        }
    }

    /// Returns `true` if the lease has lapsed at `now_ms`.
    #[must_use]
    pub const fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }

    /// Renews the lease to a new expiry.
    ///
    /// A renewal must extend the lease; a renewal that would move the expiry
    /// backwards (or leave it unchanged) is refused, and renewing a terminal
    /// ticket is refused.
    pub fn renew(&mut self, new_expires_at_ms: u64) -> Result<(), LeaseError> {
        if self.state.is_terminal() {
            return Err(LeaseError::TicketAlreadyTerminal {
                ticket_id: self.id,
                current_state: self.state.as_str(),
            });
        }
        if new_expires_at_ms <= self.expires_at_ms {
            return Err(LeaseError::RenewalDoesNotExtend {
                ticket_id: self.id,
                current_expires_at_ms: self.expires_at_ms,
                new_expires_at_ms,
            });
        }
        self.expires_at_ms = new_expires_at_ms;
        self.renewal_count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_ticket() -> Ticket {
        Ticket::new(
            TicketId::new(1),
            ConvKey::derive(&["a".into(), "b".into()]),
            vec!["a".into(), "b".into()],
            1_000,
            16_000,
        )
    }

    #[test]
    fn test_ticket_id_display() {
        assert_eq!(TicketId::new(42).to_string(), "ticket-42");
    }

    #[test]
    fn test_new_ticket_is_reserved() {
        let ticket = make_ticket();
        assert_eq!(ticket.state, TicketState::Reserved);
        assert!(!ticket.state.is_terminal());
        assert_eq!(ticket.renewal_count, 0);
    }

    #[test]
    fn test_expiry_check() {
        let ticket = make_ticket();
        assert!(!ticket.is_expired_at(15_999));
        assert!(ticket.is_expired_at(16_000));
    }

    #[test]
    fn test_renew_extends() {
        let mut ticket = make_ticket();
        ticket.renew(20_000).unwrap();
        assert_eq!(ticket.expires_at_ms, 20_000);
        assert_eq!(ticket.renewal_count, 1);
    }

    #[test]
    fn test_renew_must_extend() {
        let mut ticket = make_ticket();
        let err = ticket.renew(16_000).unwrap_err();
        assert!(matches!(err, LeaseError::RenewalDoesNotExtend { .. }));
    }

    #[test]
    fn test_renew_terminal_refused() {
        let mut ticket = make_ticket();
        ticket.state = TicketState::Released;
        let err = ticket.renew(30_000).unwrap_err();
        assert!(matches!(err, LeaseError::TicketAlreadyTerminal { .. }));
    }
}
