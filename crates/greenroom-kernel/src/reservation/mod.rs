//! Resource reservation kernel.
//!
//! Single source of truth for "who is allowed to run right now". The kernel
//! grants time-bounded [`Ticket`]s that hold a conversation key and every
//! participant it names, and carries the three admission side-structures the
//! coordinator consults around reservation: the coalescing gate, the cooldown
//! tracker, and the idempotency cache.
//!
//! # Architecture
//!
//! ```text
//! ReservationKernel
//!     ├── state: Mutex<KernelState>
//!     │       ├── tickets: HashMap<TicketId, Ticket>
//!     │       ├── by_conv_key: HashMap<ConvKey, TicketId>
//!     │       └── participant_refs: HashMap<ParticipantId, ParticipantHold>
//!     ├── coalescer: Coalescer
//!     ├── cooldowns: CooldownTracker
//!     └── idempotency: IdempotencyCache
//! ```
//!
//! # Atomicity
//!
//! `try_reserve` checks the conversation key and every participant and
//! inserts the grant under one lock acquisition: two simultaneous claims
//! sharing a participant cannot both succeed. All mutable reservation state
//! lives under a single `Mutex<KernelState>` so there is no lock ordering to
//! get wrong.
//!
//! There is no cross-structure transaction beyond that: cooldown, coalescing,
//! and idempotency are independently consistent, and callers must not assume
//! a combined "check three maps and act" step exists.

mod coalesce;
mod cooldown;
mod idempotency;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use greenroom_core::{
    ConvKey, EpisodeResult, Fingerprint, LeaseError, ParticipantId, ReserveRefused, ResourceClaim,
    Ticket, TicketId, TicketState,
};
use tracing::{debug, trace, warn};

pub use coalesce::Coalescer;
pub use cooldown::{cooldown_key, CooldownTracker};
pub use idempotency::{IdempotencyCache, IdempotencyStats};

/// Maximum live tickets; reservations beyond this are refused.
pub const MAX_ACTIVE_TICKETS: usize = 4_096;

/// Hold record for one participant.
#[derive(Debug, Clone, Copy)]
struct ParticipantHold {
    /// Live tickets referencing this participant. Exclusive claims keep this
    /// at 1; only non-exclusive claims can stack.
    count: u32,
    /// Most recent ticket referencing this participant.
    holder: TicketId,
}

#[derive(Debug, Default)]
struct KernelState {
    tickets: HashMap<TicketId, Ticket>,
    by_conv_key: HashMap<ConvKey, TicketId>,
    participant_refs: HashMap<ParticipantId, ParticipantHold>,
}

/// Counters exposed on the diagnostics surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelStats {
    /// Live tickets.
    pub active_tickets: usize,
    /// Participants currently referenced by at least one ticket.
    pub held_participants: usize,
    /// Cooldown entries (including lazily-expired ones not yet pruned).
    pub cooldown_entries: usize,
    /// Idempotency cache entries.
    pub idempotency_entries: usize,
}

/// In-memory admission-control engine.
///
/// Thread safety: every method is callable from any thread; `&self` methods
/// take short-lived internal locks and never hold one across an await point.
#[derive(Debug)]
pub struct ReservationKernel {
    state: Mutex<KernelState>,
    coalescer: Coalescer,
    cooldowns: CooldownTracker,
    idempotency: IdempotencyCache,
    next_ticket_id: AtomicU64,
    reservation_ttl_ms: u64,
}

impl ReservationKernel {
    /// Creates a kernel issuing leases of `reservation_ttl_ms`.
    #[must_use]
    pub fn new(reservation_ttl_ms: u64) -> Self {
        Self {
            state: Mutex::new(KernelState::default()),
            coalescer: Coalescer::new(),
            cooldowns: CooldownTracker::new(),
            idempotency: IdempotencyCache::new(),
            next_ticket_id: AtomicU64::new(1),
            reservation_ttl_ms,
        }
    }

    /// Issues a ticket id without registering anything.
    ///
    /// Used for the synthetic tickets attached to idempotency-cache hits,
    /// which have nothing to release.
    pub fn issue_ticket_id(&self) -> TicketId {
        TicketId::new(self.next_ticket_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Atomically reserves a claim.
    ///
    /// Refuses if the conversation key is held, if (for exclusive claims)
    /// any participant is held, or if the kernel is saturated. On success
    /// the returned ticket expires at `now_ms + reservation_ttl_ms` unless
    /// renewed.
    pub fn try_reserve(
        &self,
        claim: &ResourceClaim,
        now_ms: u64,
    ) -> Result<Ticket, ReserveRefused> {
        let mut state = self.state.lock().expect("lock poisoned");

        if state.tickets.len() >= MAX_ACTIVE_TICKETS {
            return Err(ReserveRefused::Saturated {
                active: state.tickets.len(),
            });
        }
        if let Some(&holder) = state.by_conv_key.get(&claim.conv_key) {
            return Err(ReserveRefused::ConvKeyBusy {
                conv_key: claim.conv_key.clone(),
                holder,
            });
        }
        if claim.exclusive {
            for participant in &claim.participants {
                if let Some(hold) = state.participant_refs.get(participant) {
                    if hold.count > 0 {
                        return Err(ReserveRefused::ParticipantBusy {
                            participant: participant.clone(),
                            holder: hold.holder,
                        });
                    }
                }
            }
        }

        let id = self.issue_ticket_id();
        let ticket = Ticket::new(
            id,
            claim.conv_key.clone(),
            claim.participants.clone(),
            now_ms,
            now_ms.saturating_add(self.reservation_ttl_ms),
        );

        state.by_conv_key.insert(claim.conv_key.clone(), id);
        for participant in &claim.participants {
            state
                .participant_refs
                .entry(participant.clone())
                .and_modify(|hold| {
                    hold.count += 1;
                    hold.holder = id;
                })
                .or_insert(ParticipantHold { count: 1, holder: id });
        }
        state.tickets.insert(id, ticket.clone());

        debug!(ticket = %id, conv_key = %claim.conv_key, "reserved");
        Ok(ticket)
    }

    /// Renews a live ticket's lease to `now_ms + ttl_ms`.
    ///
    /// Returns the new expiry. Renewals that would not extend the lease are
    /// refused, as are renewals of unknown tickets.
    pub fn extend_lease(
        &self,
        ticket_id: TicketId,
        ttl_ms: u64,
        now_ms: u64,
    ) -> Result<u64, LeaseError> {
        let mut state = self.state.lock().expect("lock poisoned");
        let ticket = state
            .tickets
            .get_mut(&ticket_id)
            .ok_or(LeaseError::TicketNotFound { ticket_id })?;
        let new_expiry = now_ms.saturating_add(ttl_ms);
        ticket.renew(new_expiry)?;
        trace!(ticket = %ticket_id, expires_at_ms = new_expiry, "lease renewed");
        Ok(new_expiry)
    }

    /// Releases a ticket, freeing its conversation key and participants.
    ///
    /// Idempotent: releasing an unknown (already released) id returns
    /// `None`.
    pub fn release(&self, ticket_id: TicketId) -> Option<Ticket> {
        let released = self.remove_ticket(ticket_id, TicketState::Released);
        if let Some(ticket) = &released {
            debug!(ticket = %ticket_id, conv_key = %ticket.conv_key, "released");
        }
        released
    }

    /// Force-releases a ticket from the diagnostics surface.
    pub fn force_release(&self, ticket_id: TicketId) -> Option<Ticket> {
        let released = self.remove_ticket(ticket_id, TicketState::Released);
        if let Some(ticket) = &released {
            warn!(ticket = %ticket_id, conv_key = %ticket.conv_key, "force-released");
        }
        released
    }

    /// Force-releases every ticket whose lease lapsed without renewal.
    ///
    /// Wired as a periodic main-loop task by the composition root so that an
    /// abandoned ticket (a crashed executor that stopped heartbeating) does
    /// not hold its participants forever.
    pub fn sweep_expired(&self, now_ms: u64) -> Vec<Ticket> {
        let expired_ids: Vec<TicketId> = {
            let state = self.state.lock().expect("lock poisoned");
            state
                .tickets
                .values()
                .filter(|t| t.is_expired_at(now_ms))
                .map(|t| t.id)
                .collect()
        };

        let mut swept = Vec::with_capacity(expired_ids.len());
        for id in expired_ids {
            if let Some(ticket) = self.remove_ticket(id, TicketState::Expired) {
                warn!(
                    ticket = %id,
                    conv_key = %ticket.conv_key,
                    expired_at_ms = ticket.expires_at_ms,
                    "swept expired lease"
                );
                swept.push(ticket);
            }
        }
        swept
    }

    /// O(1) advisory check: is this conversation key held?
    ///
    /// An optimization for trigger self-filtering, not a substitute for
    /// `try_reserve`'s atomicity.
    pub fn is_busy_conv_key(&self, conv_key: &ConvKey) -> bool {
        let state = self.state.lock().expect("lock poisoned");
        state.by_conv_key.contains_key(conv_key)
    }

    /// O(1) advisory check: is this participant held?
    pub fn is_busy_participant(&self, participant: &ParticipantId) -> bool {
        let state = self.state.lock().expect("lock poisoned");
        state
            .participant_refs
            .get(participant)
            .is_some_and(|hold| hold.count > 0)
    }

    /// Snapshot of every live ticket.
    pub fn active_tickets(&self) -> Vec<Ticket> {
        let state = self.state.lock().expect("lock poisoned");
        state.tickets.values().cloned().collect()
    }

    /// Looks up a live ticket by id.
    pub fn get_ticket(&self, ticket_id: TicketId) -> Option<Ticket> {
        let state = self.state.lock().expect("lock poisoned");
        state.tickets.get(&ticket_id).cloned()
    }

    /// Counters for the diagnostics surface.
    pub fn stats(&self) -> KernelStats {
        let state = self.state.lock().expect("lock poisoned");
        KernelStats {
            active_tickets: state.tickets.len(),
            held_participants: state.participant_refs.len(),
            cooldown_entries: self.cooldowns.len(),
            idempotency_entries: self.idempotency.len(),
        }
    }

    // -------------------------------------------------------------------------
    // Coalescing / cooldown / idempotency façade
    // -------------------------------------------------------------------------

    /// Deduplicates near-simultaneous requests for one conversation key.
    ///
    /// See [`Coalescer::coalesce_within`]. Returns `true` for the single
    /// caller that won leadership of the window.
    pub async fn coalesce_within<F>(&self, conv_key: &ConvKey, window_ms: u64, leader_work: F) -> bool
    where
        F: FnOnce(),
    {
        self.coalescer
            .coalesce_within(conv_key, window_ms, leader_work)
            .await
    }

    /// Returns `true` if `key` is inside its cooldown window at `now_ms`.
    pub fn is_in_cooldown(&self, key: &str, now_ms: u64) -> bool {
        self.cooldowns.is_in_cooldown(key, now_ms)
    }

    /// Arms a cooldown for `key` lasting `duration_ms` from `now_ms`.
    pub fn set_cooldown(&self, key: &str, duration_ms: u64, now_ms: u64) {
        self.cooldowns.set(key, duration_ms, now_ms);
    }

    /// Looks up a cached result by request fingerprint.
    pub fn idempotency_get(&self, fingerprint: &Fingerprint, now_ms: u64) -> Option<EpisodeResult> {
        self.idempotency.get(fingerprint, now_ms)
    }

    /// Caches a result under a request fingerprint for `ttl_ms`.
    pub fn idempotency_set(
        &self,
        fingerprint: Fingerprint,
        result: EpisodeResult,
        ttl_ms: u64,
        now_ms: u64,
    ) {
        self.idempotency.set(fingerprint, result, ttl_ms, now_ms);
    }

    /// Drops every cached result (diagnostics surface).
    pub fn clear_idempotency_cache(&self) {
        self.idempotency.clear();
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn remove_ticket(&self, ticket_id: TicketId, final_state: TicketState) -> Option<Ticket> {
        debug_assert!(final_state.is_terminal());
        let mut state = self.state.lock().expect("lock poisoned");
        let mut ticket = state.tickets.remove(&ticket_id)?;

        if state.by_conv_key.get(&ticket.conv_key) == Some(&ticket_id) {
            state.by_conv_key.remove(&ticket.conv_key);
        }
        for participant in &ticket.participants {
            if let Some(hold) = state.participant_refs.get_mut(participant) {
                hold.count = hold.count.saturating_sub(1);
                if hold.count == 0 {
                    state.participant_refs.remove(participant);
                }
            }
        }

        ticket.state = final_state;
        Some(ticket)
    }
}

#[cfg(test)]
mod tests {
    use greenroom_core::ConvKey;

    use super::*;

    fn claim(names: &[&str]) -> ResourceClaim {
        let participants: Vec<ParticipantId> = names.iter().map(|n| (*n).into()).collect();
        ResourceClaim::exclusive(ConvKey::derive(&participants), participants)
    }

    #[test]
    fn test_reserve_and_release() {
        let kernel = ReservationKernel::new(15_000);
        let ticket = kernel.try_reserve(&claim(&["a", "b"]), 0).unwrap();
        assert_eq!(ticket.expires_at_ms, 15_000);
        assert!(kernel.is_busy_conv_key(&ticket.conv_key));
        assert!(kernel.is_busy_participant(&"a".into()));

        let released = kernel.release(ticket.id).unwrap();
        assert_eq!(released.state, TicketState::Released);
        assert!(!kernel.is_busy_conv_key(&ticket.conv_key));
        assert!(!kernel.is_busy_participant(&"a".into()));
    }

    #[test]
    fn test_conv_key_conflict_refused() {
        let kernel = ReservationKernel::new(15_000);
        let first = kernel.try_reserve(&claim(&["a", "b"]), 0).unwrap();
        let refused = kernel.try_reserve(&claim(&["b", "a"]), 0).unwrap_err();
        assert!(matches!(
            refused,
            ReserveRefused::ConvKeyBusy { holder, .. } if holder == first.id
        ));
    }

    #[test]
    fn test_shared_participant_refused() {
        let kernel = ReservationKernel::new(15_000);
        let first = kernel.try_reserve(&claim(&["a", "b"]), 0).unwrap();
        let refused = kernel.try_reserve(&claim(&["b", "c"]), 0).unwrap_err();
        assert!(matches!(
            refused,
            ReserveRefused::ParticipantBusy { holder, .. } if holder == first.id
        ));
    }

    #[test]
    fn test_disjoint_claims_both_succeed() {
        let kernel = ReservationKernel::new(15_000);
        kernel.try_reserve(&claim(&["a", "b"]), 0).unwrap();
        kernel.try_reserve(&claim(&["c", "d"]), 0).unwrap();
        assert_eq!(kernel.stats().active_tickets, 2);
    }

    #[test]
    fn test_release_is_idempotent() {
        let kernel = ReservationKernel::new(15_000);
        let ticket = kernel.try_reserve(&claim(&["a", "b"]), 0).unwrap();
        assert!(kernel.release(ticket.id).is_some());
        assert!(kernel.release(ticket.id).is_none());
    }

    #[test]
    fn test_release_frees_for_new_reservation() {
        let kernel = ReservationKernel::new(15_000);
        let ticket = kernel.try_reserve(&claim(&["a", "b"]), 0).unwrap();
        kernel.release(ticket.id);
        kernel.try_reserve(&claim(&["a", "b"]), 1).unwrap();
    }

    #[test]
    fn test_extend_lease_bumps_expiry() {
        let kernel = ReservationKernel::new(15_000);
        let ticket = kernel.try_reserve(&claim(&["a", "b"]), 0).unwrap();
        let new_expiry = kernel.extend_lease(ticket.id, 15_000, 5_000).unwrap();
        assert_eq!(new_expiry, 20_000);
        assert_eq!(kernel.get_ticket(ticket.id).unwrap().renewal_count, 1);
    }

    #[test]
    fn test_extend_unknown_ticket_fails() {
        let kernel = ReservationKernel::new(15_000);
        let err = kernel.extend_lease(TicketId::new(99), 15_000, 0).unwrap_err();
        assert!(matches!(err, LeaseError::TicketNotFound { .. }));
    }

    #[test]
    fn test_sweep_force_releases_expired() {
        let kernel = ReservationKernel::new(15_000);
        let stale = kernel.try_reserve(&claim(&["a", "b"]), 0).unwrap();
        let fresh = kernel.try_reserve(&claim(&["c", "d"]), 10_000).unwrap();

        let swept = kernel.sweep_expired(16_000);
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].id, stale.id);
        assert_eq!(swept[0].state, TicketState::Expired);

        assert!(kernel.get_ticket(fresh.id).is_some());
        assert!(!kernel.is_busy_participant(&"a".into()));
    }

    #[test]
    fn test_renewed_lease_survives_sweep() {
        let kernel = ReservationKernel::new(15_000);
        let ticket = kernel.try_reserve(&claim(&["a", "b"]), 0).unwrap();
        kernel.extend_lease(ticket.id, 15_000, 10_000).unwrap();
        assert!(kernel.sweep_expired(16_000).is_empty());
        assert!(kernel.get_ticket(ticket.id).is_some());
    }

    #[test]
    fn test_saturation_refused() {
        let kernel = ReservationKernel::new(15_000);
        for i in 0..MAX_ACTIVE_TICKETS {
            let a = format!("a{i}");
            let b = format!("b{i}");
            kernel
                .try_reserve(&claim(&[a.as_str(), b.as_str()]), 0)
                .unwrap();
        }
        let refused = kernel.try_reserve(&claim(&["x", "y"]), 0).unwrap_err();
        assert!(matches!(refused, ReserveRefused::Saturated { .. }));
    }

    #[test]
    fn test_concurrent_overlapping_claims_one_winner() {
        use std::sync::Arc;

        let kernel = Arc::new(ReservationKernel::new(15_000));
        let mut handles = Vec::new();
        for i in 0..16 {
            let kernel = Arc::clone(&kernel);
            handles.push(std::thread::spawn(move || {
                // Every claim shares participant "pivot".
                let other = format!("npc-{i}");
                let participants: Vec<ParticipantId> =
                    vec!["pivot".into(), other.as_str().into()];
                let claim =
                    ResourceClaim::exclusive(ConvKey::derive(&participants), participants);
                kernel.try_reserve(&claim, 0).is_ok()
            }));
        }
        let wins = handles
            .into_iter()
            .map(|handle| handle.join().unwrap_or(false))
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1, "exactly one overlapping claim may win");
    }
}
