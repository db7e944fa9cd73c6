//! Stage coordinator.
//!
//! The orchestration façade. [`StageCoordinator::submit_intent`] applies the
//! admission pipeline — coalesce, cooldown, idempotency, reserve, in that
//! order — and, once a reservation is granted, dispatches execution in the
//! background and returns immediately. The submitting caller never waits on
//! the episode itself.
//!
//! # Execution flow
//!
//! ```text
//! submit_intent
//!     1. normalize participants -> conv key (< 2 distinct: rejected)
//!     2. coalesce window         (non-manual only; losers: Coalesced)
//!     3. cooldown gate           (non-manual only)
//!     4. idempotency lookup      (hit: Approved with cached result)
//!     5. try_reserve             (refused: Rejected(ConflictOrBusy))
//!     6. spawn route_and_execute; return Approved(ticket)
//!
//! route_and_execute (background)
//!     resolve act -> eligibility -> heartbeat ++ deadline-raced execution
//!     -> record result -> cache result -> release ticket -> arm cooldown
//! ```
//!
//! # Cancellation is best-effort
//!
//! When the hard deadline elapses, the coordinator cancels the act's token,
//! synthesizes a timeout result, and detaches the still-running act task. An
//! act that ignores its token keeps burning its own task until it returns;
//! the lease and participants are freed regardless.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use greenroom_core::{
    Clock, ConvKey, Decision, EpisodeReason, EpisodeRequest, EpisodeResult, Fingerprint, Intent,
    ParticipantId, RejectReason, ResourceClaim, StageConfig, Ticket, TicketId,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::act::ActRegistry;
use crate::history::{HistoryEntry, HistorySink};
use crate::reservation::{cooldown_key, ReservationKernel};

/// A live episode, as reported by the diagnostics surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningEpisode {
    /// Episode name.
    pub episode: String,
    /// Conversation being held.
    pub conv_key: ConvKey,
    /// Held participants.
    pub participants: Vec<ParticipantId>,
    /// The backing ticket.
    pub ticket_id: TicketId,
    /// Current lease expiry (ms since epoch).
    pub lease_expires_at_ms: u64,
    /// When execution was dispatched (ms since epoch).
    pub started_at_ms: u64,
}

#[derive(Debug, Clone)]
struct RunningMeta {
    episode: String,
    started_at_ms: u64,
}

/// Shared pieces handed to the background execution task.
#[derive(Clone)]
struct ExecutionCtx {
    kernel: Arc<ReservationKernel>,
    acts: Arc<ActRegistry>,
    history: Arc<dyn HistorySink>,
    clock: Arc<dyn Clock>,
    config: StageConfig,
    running: Arc<Mutex<HashMap<TicketId, RunningMeta>>>,
}

/// Admission pipeline and episode execution driver.
pub struct StageCoordinator {
    kernel: Arc<ReservationKernel>,
    acts: Arc<ActRegistry>,
    history: Arc<dyn HistorySink>,
    clock: Arc<dyn Clock>,
    config: StageConfig,
    running: Arc<Mutex<HashMap<TicketId, RunningMeta>>>,
}

impl std::fmt::Debug for StageCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageCoordinator")
            .field("acts", &self.acts.names())
            .finish_non_exhaustive()
    }
}

impl StageCoordinator {
    /// Creates a coordinator over an already-wired kernel and registry.
    pub fn new(
        kernel: Arc<ReservationKernel>,
        acts: Arc<ActRegistry>,
        history: Arc<dyn HistorySink>,
        clock: Arc<dyn Clock>,
        config: StageConfig,
    ) -> Self {
        Self {
            kernel,
            acts,
            history,
            clock,
            config,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Submits an intent through the admission pipeline.
    ///
    /// Suspends for at most one coalescing window (non-manual intents only);
    /// an approval returns as soon as execution has been dispatched.
    pub async fn submit_intent(&self, intent: Intent) -> Decision {
        let roster = ParticipantId::normalize(&intent.participants);
        if roster.len() < 2 {
            debug!(
                episode = %intent.episode,
                distinct = roster.len(),
                "rejected: too few participants"
            );
            return Decision::rejected(RejectReason::TooFewParticipants);
        }
        let conv_key = ConvKey::from_roster(&roster);

        if !intent.origin.is_manual() {
            let won = self
                .kernel
                .coalesce_within(&conv_key, self.config.coalesce_window_ms, || {})
                .await;
            if !won {
                debug!(conv_key = %conv_key, "merged into concurrent submission");
                return Decision::coalesced();
            }

            let key = cooldown_key(&intent.episode, &conv_key);
            if self.kernel.is_in_cooldown(&key, self.clock.now_ms()) {
                debug!(conv_key = %conv_key, episode = %intent.episode, "rejected: cooling");
                return Decision::rejected(RejectReason::Cooling);
            }
        }

        let fingerprint = Fingerprint::compute(
            &intent.episode,
            &conv_key,
            intent.scenario.as_deref(),
            intent.seed,
        );
        if let Some(cached) = self.kernel.idempotency_get(&fingerprint, self.clock.now_ms()) {
            debug!(fingerprint = %fingerprint, "answered from idempotency cache");
            return Decision::approved_cached(self.kernel.issue_ticket_id(), cached);
        }

        let claim = ResourceClaim::exclusive(conv_key.clone(), roster.clone());
        let ticket = match self.kernel.try_reserve(&claim, self.clock.now_ms()) {
            Ok(ticket) => ticket,
            Err(refused) => {
                debug!(conv_key = %conv_key, reason = refused.kind(), "rejected: reservation refused");
                return Decision::rejected(RejectReason::ConflictOrBusy);
            }
        };

        let request = EpisodeRequest {
            ticket_id: ticket.id,
            episode: intent.episode,
            conv_key,
            participants: roster,
            scenario: intent.scenario,
            seed: intent.seed,
            locale: intent.locale,
        };
        let decision = Decision::approved(ticket.id);
        tokio::spawn(route_and_execute(self.ctx(), ticket, request, fingerprint));
        decision
    }

    /// Registered episode names (diagnostics surface).
    pub fn list_acts(&self) -> Vec<String> {
        self.acts.names()
    }

    /// Every episode currently holding a ticket (diagnostics surface).
    pub fn query_running(&self) -> Vec<RunningEpisode> {
        let running = self.running.lock().expect("lock poisoned");
        let mut episodes: Vec<RunningEpisode> = running
            .iter()
            .filter_map(|(ticket_id, meta)| {
                let ticket = self.kernel.get_ticket(*ticket_id)?;
                Some(RunningEpisode {
                    episode: meta.episode.clone(),
                    conv_key: ticket.conv_key,
                    participants: ticket.participants,
                    ticket_id: *ticket_id,
                    lease_expires_at_ms: ticket.expires_at_ms,
                    started_at_ms: meta.started_at_ms,
                })
            })
            .collect();
        episodes.sort_by_key(|episode| episode.ticket_id);
        episodes
    }

    /// Force-releases a ticket (diagnostics surface). Returns `true` if a
    /// live ticket was released.
    pub fn force_release(&self, ticket_id: TicketId) -> bool {
        self.running.lock().expect("lock poisoned").remove(&ticket_id);
        self.kernel.force_release(ticket_id).is_some()
    }

    /// Drops every cached result (diagnostics surface).
    pub fn clear_idempotency_cache(&self) {
        self.kernel.clear_idempotency_cache();
    }

    fn ctx(&self) -> ExecutionCtx {
        ExecutionCtx {
            kernel: Arc::clone(&self.kernel),
            acts: Arc::clone(&self.acts),
            history: Arc::clone(&self.history),
            clock: Arc::clone(&self.clock),
            config: self.config.clone(),
            running: Arc::clone(&self.running),
        }
    }
}

/// Background half of an approved submission.
///
/// Resolves the act, races it against the hard deadline under a lease
/// heartbeat, and unconditionally records, caches, releases, and arms the
/// cooldown at the end.
async fn route_and_execute(
    ctx: ExecutionCtx,
    ticket: Ticket,
    request: EpisodeRequest,
    fingerprint: Fingerprint,
) {
    let started_at_ms = ctx.clock.now_ms();
    let exec_start = Instant::now();

    let mut result = match ctx.acts.get(&request.episode) {
        None => {
            warn!(episode = %request.episode, "no act registered for episode");
            EpisodeResult::failed(EpisodeReason::ActNotFound, 0)
        }
        Some(act) if !act.is_eligible(&request) => {
            debug!(episode = %request.episode, conv_key = %request.conv_key, "act declined eligibility");
            EpisodeResult::failed(EpisodeReason::Rejected, 0)
        }
        Some(act) => {
            ctx.running.lock().expect("lock poisoned").insert(
                ticket.id,
                RunningMeta {
                    episode: request.episode.clone(),
                    started_at_ms,
                },
            );

            let heartbeat = spawn_heartbeat(&ctx, ticket.id);
            let cancel = CancellationToken::new();
            let mut act_task = {
                let act = Arc::clone(&act);
                let request = request.clone();
                let token = cancel.child_token();
                tokio::spawn(async move { act.execute(request, token).await })
            };

            let deadline = Duration::from_millis(ctx.config.episode_deadline_ms);
            let result = tokio::select! {
                joined = &mut act_task => match joined {
                    Ok(result) => result,
                    Err(join_error) => {
                        error!(
                            episode = %request.episode,
                            conv_key = %request.conv_key,
                            panicked = join_error.is_panic(),
                            "act task failed"
                        );
                        EpisodeResult::failed(EpisodeReason::Exception, 0)
                    }
                },
                () = tokio::time::sleep(deadline) => {
                    // Request cancellation and walk away; the act task stays
                    // detached until it notices the token.
                    cancel.cancel();
                    warn!(
                        episode = %request.episode,
                        conv_key = %request.conv_key,
                        deadline_ms = ctx.config.episode_deadline_ms,
                        "episode hit hard deadline"
                    );
                    EpisodeResult::failed(EpisodeReason::Timeout, 0)
                }
            };
            heartbeat.cancel();
            result
        }
    };

    result.latency_ms = exec_start.elapsed().as_millis() as u64;
    info!(
        episode = %request.episode,
        conv_key = %request.conv_key,
        reason = result.reason.as_str(),
        latency_ms = result.latency_ms,
        "episode finished"
    );

    let now_ms = ctx.clock.now_ms();
    if let Err(err) = ctx.history.record(HistoryEntry {
        episode: request.episode.clone(),
        conv_key: request.conv_key.clone(),
        result: result.clone(),
        recorded_at_ms: now_ms,
    }) {
        warn!(error = %err, "history sink rejected record");
    }
    ctx.kernel
        .idempotency_set(fingerprint, result, ctx.config.idempotency_ttl_ms, now_ms);

    ctx.running.lock().expect("lock poisoned").remove(&ticket.id);
    ctx.kernel.release(ticket.id);
    ctx.kernel.set_cooldown(
        &cooldown_key(&request.episode, &request.conv_key),
        ctx.config.cooldown_ms,
        now_ms,
    );
}

/// Renews the ticket's lease until cancelled. Renewal failures are swallowed;
/// the heartbeat is best-effort by contract.
fn spawn_heartbeat(ctx: &ExecutionCtx, ticket_id: TicketId) -> CancellationToken {
    let token = CancellationToken::new();
    let stop = token.clone();
    let kernel = Arc::clone(&ctx.kernel);
    let clock = Arc::clone(&ctx.clock);
    let interval = Duration::from_millis(ctx.config.heartbeat_interval_ms);
    let ttl_ms = ctx.config.reservation_ttl_ms;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = stop.cancelled() => break,
                () = tokio::time::sleep(interval) => {
                    if let Err(err) = kernel.extend_lease(ticket_id, ttl_ms, clock.now_ms()) {
                        debug!(ticket = %ticket_id, error = %err, "lease renewal failed");
                    }
                }
            }
        }
    });
    token
}
