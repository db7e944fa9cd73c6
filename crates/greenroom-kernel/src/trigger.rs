//! Triggers: intent producers.
//!
//! A trigger samples world state and may submit an [`Intent`]; it knows
//! nothing about leasing. Triggers see the kernel only through the advisory
//! [`BusyProbe`] (cheap self-filtering before building an intent) and submit
//! through the coordinator's [`SubmitHandle`]; the real admission decision
//! always happens inside `submit_intent`.

use std::sync::{Arc, Mutex};

use greenroom_core::{CompositionError, ConvKey, Decision, Intent, ParticipantId};
use rand::Rng;
use tracing::{debug, info};

use crate::act::BoxFuture;
use crate::coordinator::StageCoordinator;
use crate::reservation::ReservationKernel;

/// Maximum registered triggers.
pub const MAX_TRIGGERS: usize = 64;

/// Narrow read interface over the kernel for trigger self-filtering.
///
/// An optimization only: a probe that says "free" can still lose the
/// subsequent reservation race.
#[derive(Clone)]
pub struct BusyProbe {
    kernel: Arc<ReservationKernel>,
}

impl BusyProbe {
    pub(crate) fn new(kernel: Arc<ReservationKernel>) -> Self {
        Self { kernel }
    }

    /// Is this conversation key currently held?
    #[must_use]
    pub fn is_busy_conv_key(&self, conv_key: &ConvKey) -> bool {
        self.kernel.is_busy_conv_key(conv_key)
    }

    /// Is this participant currently held?
    #[must_use]
    pub fn is_busy_participant(&self, participant: &ParticipantId) -> bool {
        self.kernel.is_busy_participant(participant)
    }

    /// Is any participant of this group currently held?
    #[must_use]
    pub fn is_any_busy(&self, participants: &[ParticipantId]) -> bool {
        participants.iter().any(|p| self.is_busy_participant(p))
    }
}

/// Submission entry point handed to triggers.
#[derive(Clone)]
pub struct SubmitHandle {
    coordinator: Arc<StageCoordinator>,
}

impl SubmitHandle {
    pub(crate) fn new(coordinator: Arc<StageCoordinator>) -> Self {
        Self { coordinator }
    }

    /// Submits an intent through the admission pipeline.
    pub async fn submit(&self, intent: Intent) -> Decision {
        self.coordinator.submit_intent(intent).await
    }
}

/// An intent producer.
pub trait Trigger: Send + Sync {
    /// Trigger name (diagnostics surface).
    fn name(&self) -> &str;

    /// Episode name this trigger produces intents for.
    fn target_episode(&self) -> &str;

    /// Called once when the stage is composed.
    fn on_enable(&self) {}

    /// Called once when the stage shuts down.
    fn on_disable(&self) {}

    /// One scan-and-maybe-submit pass.
    fn run_once<'a>(&'a self, probe: &'a BusyProbe, submit: &'a SubmitHandle) -> BoxFuture<'a, ()>;
}

/// Registry of triggers, scanned on the composition root's cadence.
#[derive(Default)]
pub struct TriggerSet {
    triggers: Vec<Arc<dyn Trigger>>,
}

impl TriggerSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a trigger; duplicate names are a composition error.
    pub fn register(&mut self, trigger: Arc<dyn Trigger>) -> Result<(), CompositionError> {
        if self.triggers.len() >= MAX_TRIGGERS {
            return Err(CompositionError::RegistryFull {
                what: "triggers",
                max: MAX_TRIGGERS,
            });
        }
        if self.triggers.iter().any(|t| t.name() == trigger.name()) {
            return Err(CompositionError::DuplicateTrigger {
                name: trigger.name().to_string(),
            });
        }
        self.triggers.push(trigger);
        Ok(())
    }

    /// Registered trigger names, in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.triggers.iter().map(|t| t.name().to_string()).collect()
    }

    /// Number of registered triggers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    /// Returns `true` if no triggers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    /// Iterates over registered triggers.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Trigger>> {
        self.triggers.iter()
    }

    /// Runs every trigger's scan pass once, sequentially.
    pub async fn scan_all(&self, probe: &BusyProbe, submit: &SubmitHandle) {
        for trigger in &self.triggers {
            debug!(trigger = %trigger.name(), "trigger scan");
            trigger.run_once(probe, submit).await;
        }
    }
}

impl std::fmt::Debug for TriggerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerSet").field("names", &self.names()).finish()
    }
}

/// Candidate source for [`RandomEncounterTrigger`]: returns groups of
/// participants that could plausibly start a conversation right now.
pub type CandidateFn = dyn Fn() -> Vec<Vec<ParticipantId>> + Send + Sync;

/// Samples candidate groups and submits at most one intent per scan, with a
/// per-candidate firing probability.
pub struct RandomEncounterTrigger {
    name: String,
    episode: String,
    chance: f64,
    candidates: Arc<CandidateFn>,
}

impl RandomEncounterTrigger {
    /// Creates a random trigger firing with `chance` in `[0, 1]` per
    /// candidate group.
    pub fn new(
        name: impl Into<String>,
        episode: impl Into<String>,
        chance: f64,
        candidates: Arc<CandidateFn>,
    ) -> Self {
        Self {
            name: name.into(),
            episode: episode.into(),
            chance: chance.clamp(0.0, 1.0),
            candidates,
        }
    }
}

impl Trigger for RandomEncounterTrigger {
    fn name(&self) -> &str {
        &self.name
    }

    fn target_episode(&self) -> &str {
        &self.episode
    }

    fn run_once<'a>(&'a self, probe: &'a BusyProbe, submit: &'a SubmitHandle) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            for group in (self.candidates)() {
                if probe.is_any_busy(&group) {
                    continue;
                }
                let fired = { rand::thread_rng().gen_bool(self.chance) };
                if !fired {
                    continue;
                }
                let decision = submit.submit(Intent::automatic(&self.episode, group)).await;
                debug!(
                    trigger = %self.name,
                    episode = %self.episode,
                    approved = decision.is_approved(),
                    "random trigger submitted"
                );
                // One submission per scan keeps a single trigger from
                // flooding admission in one pass.
                break;
            }
        })
    }
}

/// A trigger armed explicitly for one shot.
///
/// The next scan after [`ManualTrigger::arm`] must attempt submission with
/// the armed participants (no sampling involved), then the trigger disarms
/// itself.
pub struct ManualTrigger {
    name: String,
    episode: String,
    armed: Mutex<Option<ArmedShot>>,
}

#[derive(Debug, Clone)]
struct ArmedShot {
    participants: Vec<ParticipantId>,
    scenario: Option<String>,
}

impl ManualTrigger {
    /// Creates a disarmed manual trigger.
    pub fn new(name: impl Into<String>, episode: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            episode: episode.into(),
            armed: Mutex::new(None),
        }
    }

    /// Arms the trigger for one submission on the next scan.
    pub fn arm(&self, participants: Vec<ParticipantId>, scenario: Option<String>) {
        let mut armed = self.armed.lock().expect("lock poisoned");
        *armed = Some(ArmedShot {
            participants,
            scenario,
        });
        info!(trigger = %self.name, "manual trigger armed");
    }

    /// Returns `true` if a shot is waiting for the next scan.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.armed.lock().expect("lock poisoned").is_some()
    }
}

impl Trigger for ManualTrigger {
    fn name(&self) -> &str {
        &self.name
    }

    fn target_episode(&self) -> &str {
        &self.episode
    }

    fn run_once<'a>(&'a self, _probe: &'a BusyProbe, submit: &'a SubmitHandle) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let shot = { self.armed.lock().expect("lock poisoned").take() };
            let Some(shot) = shot else {
                return;
            };
            let mut intent = Intent::manual(&self.episode, shot.participants);
            intent.scenario = shot.scenario;
            let decision = submit.submit(intent).await;
            info!(
                trigger = %self.name,
                episode = %self.episode,
                approved = decision.is_approved(),
                "manual trigger fired"
            );
        })
    }
}

/// Builds a candidate source from a fixed list of groups.
#[must_use]
pub fn fixed_candidates(groups: Vec<Vec<ParticipantId>>) -> Arc<CandidateFn> {
    Arc::new(move || groups.clone())
}
