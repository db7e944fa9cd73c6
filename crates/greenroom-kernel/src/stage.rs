//! Composition root.
//!
//! [`StageBuilder`] constructs the kernel, scheduler, and coordinator, wires
//! every act and trigger through constructor parameters, and validates the
//! whole arrangement before anything runs: duplicate names, triggers whose
//! target episode has no act, and invalid configs are build-time errors, not
//! first-use surprises.
//!
//! `build()` must be called from within a tokio runtime: trigger scans and
//! episode execution are spawned onto it.

use std::sync::Arc;

use greenroom_core::{
    Clock, CompositionError, Decision, Intent, StageConfig, SystemClock, TicketId,
};
use tracing::debug;

use crate::act::{Act, ActRegistry};
use crate::coordinator::{RunningEpisode, StageCoordinator};
use crate::history::{HistorySink, NullHistory};
use crate::reservation::{KernelStats, ReservationKernel};
use crate::scheduler::{FrameReport, MainLoopScheduler, PeriodicHandle, SchedulerConfig};
use crate::trigger::{BusyProbe, SubmitHandle, Trigger, TriggerSet};

/// Builder for a fully wired [`Stage`].
pub struct StageBuilder {
    config: StageConfig,
    clock: Arc<dyn Clock>,
    history: Arc<dyn HistorySink>,
    acts: Vec<Arc<dyn Act>>,
    triggers: Vec<Arc<dyn Trigger>>,
}

impl Default for StageBuilder {
    fn default() -> Self {
        Self {
            config: StageConfig::default(),
            clock: Arc::new(SystemClock),
            history: Arc::new(NullHistory),
            acts: Vec::new(),
            triggers: Vec::new(),
        }
    }
}

impl StageBuilder {
    /// Creates a builder with defaults: system clock, discarded history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the configuration.
    #[must_use]
    pub fn config(mut self, config: StageConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the clock (tests use a manual clock).
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the history sink.
    #[must_use]
    pub fn history(mut self, history: Arc<dyn HistorySink>) -> Self {
        self.history = history;
        self
    }

    /// Adds an act.
    #[must_use]
    pub fn act(mut self, act: Arc<dyn Act>) -> Self {
        self.acts.push(act);
        self
    }

    /// Adds a trigger.
    #[must_use]
    pub fn trigger(mut self, trigger: Arc<dyn Trigger>) -> Self {
        self.triggers.push(trigger);
        self
    }

    /// Validates and wires everything.
    ///
    /// # Errors
    ///
    /// Returns a [`CompositionError`] on invalid config, duplicate act or
    /// trigger names, or a trigger targeting an episode with no act.
    ///
    /// # Panics
    ///
    /// Panics if triggers are registered and no tokio runtime is current;
    /// trigger scans are spawned onto the ambient runtime.
    pub fn build(self) -> Result<Stage, CompositionError> {
        self.config.validate()?;

        let mut registry = ActRegistry::new();
        for act in self.acts {
            registry.register(act)?;
        }
        let acts = Arc::new(registry);

        let mut trigger_set = TriggerSet::new();
        for trigger in self.triggers {
            if !acts.contains(trigger.target_episode()) {
                return Err(CompositionError::UnknownTargetEpisode {
                    trigger: trigger.name().to_string(),
                    episode: trigger.target_episode().to_string(),
                });
            }
            trigger_set.register(trigger)?;
        }
        let triggers = Arc::new(trigger_set);

        let kernel = Arc::new(ReservationKernel::new(self.config.reservation_ttl_ms));
        let scheduler = MainLoopScheduler::new(SchedulerConfig::from(&self.config));
        let coordinator = Arc::new(StageCoordinator::new(
            Arc::clone(&kernel),
            Arc::clone(&acts),
            self.history,
            Arc::clone(&self.clock),
            self.config.clone(),
        ));

        let mut periodic_handles = Vec::new();
        {
            let kernel = Arc::clone(&kernel);
            let clock = Arc::clone(&self.clock);
            periodic_handles.push(scheduler.schedule_periodic(
                "lease-sweep",
                self.config.sweep_every_steps,
                self.config.sweep_every_steps,
                move || {
                    kernel.sweep_expired(clock.now_ms());
                },
            ));
        }
        if !triggers.is_empty() {
            let triggers = Arc::clone(&triggers);
            let probe = BusyProbe::new(Arc::clone(&kernel));
            let submit = SubmitHandle::new(Arc::clone(&coordinator));
            let runtime = tokio::runtime::Handle::current();
            periodic_handles.push(scheduler.schedule_periodic(
                "trigger-scan",
                self.config.trigger_scan_every_steps,
                self.config.trigger_scan_every_steps,
                move || {
                    let triggers = Arc::clone(&triggers);
                    let probe = probe.clone();
                    let submit = submit.clone();
                    runtime.spawn(async move {
                        triggers.scan_all(&probe, &submit).await;
                    });
                },
            ));
        }

        for act in acts.iter() {
            act.on_enable();
        }
        for trigger in triggers.iter() {
            trigger.on_enable();
        }
        debug!(
            acts = acts.len(),
            triggers = triggers.len(),
            "stage composed"
        );

        Ok(Stage {
            coordinator,
            scheduler,
            kernel,
            acts,
            triggers,
            periodic_handles,
        })
    }
}

/// A fully wired stage: the host's single handle to the whole subsystem.
pub struct Stage {
    coordinator: Arc<StageCoordinator>,
    scheduler: MainLoopScheduler,
    kernel: Arc<ReservationKernel>,
    acts: Arc<ActRegistry>,
    triggers: Arc<TriggerSet>,
    periodic_handles: Vec<PeriodicHandle>,
}

impl Stage {
    /// Starts building a stage.
    #[must_use]
    pub fn builder() -> StageBuilder {
        StageBuilder::new()
    }

    /// Host tick entry point; call exactly once per simulated step from the
    /// authoritative-state context.
    pub fn process_frame(&self, current_step: u64) -> FrameReport {
        self.scheduler.process_frame(current_step)
    }

    /// The scheduler handle, for acts and host code that need to hop onto
    /// the main loop.
    #[must_use]
    pub fn scheduler(&self) -> &MainLoopScheduler {
        &self.scheduler
    }

    /// Submits an intent through the admission pipeline.
    pub async fn submit(&self, intent: Intent) -> Decision {
        self.coordinator.submit_intent(intent).await
    }

    /// A cloneable submission handle for host-side producers.
    #[must_use]
    pub fn submit_handle(&self) -> SubmitHandle {
        SubmitHandle::new(Arc::clone(&self.coordinator))
    }

    // -------------------------------------------------------------------------
    // Diagnostics surface
    // -------------------------------------------------------------------------

    /// Registered episode names.
    #[must_use]
    pub fn list_acts(&self) -> Vec<String> {
        self.coordinator.list_acts()
    }

    /// Registered trigger names.
    #[must_use]
    pub fn list_triggers(&self) -> Vec<String> {
        self.triggers.names()
    }

    /// Every episode currently holding a ticket.
    #[must_use]
    pub fn query_running(&self) -> Vec<RunningEpisode> {
        self.coordinator.query_running()
    }

    /// Force-releases a ticket. Returns `true` if a live ticket was
    /// released.
    pub fn force_release(&self, ticket_id: TicketId) -> bool {
        self.coordinator.force_release(ticket_id)
    }

    /// Drops every cached idempotency result.
    pub fn clear_idempotency_cache(&self) {
        self.coordinator.clear_idempotency_cache();
    }

    /// Kernel counters.
    #[must_use]
    pub fn kernel_stats(&self) -> KernelStats {
        self.kernel.stats()
    }

    /// Cancels periodic work and disables every act and trigger.
    pub fn shutdown(&self) {
        for handle in &self.periodic_handles {
            handle.cancel();
        }
        for act in self.acts.iter() {
            act.on_disable();
        }
        for trigger in self.triggers.iter() {
            trigger.on_disable();
        }
        debug!("stage shut down");
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("acts", &self.acts.names())
            .field("triggers", &self.triggers.names())
            .finish_non_exhaustive()
    }
}
