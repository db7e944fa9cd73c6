//! Runtime configuration.
//!
//! Every tunable the runtime reads at admission or execution time lives in
//! [`StageConfig`]. Nothing here is read from the environment; the host
//! deserializes or constructs a config and hands it to the composition root,
//! which validates it once.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Ceiling applied to the coalescing window.
pub const MAX_COALESCE_WINDOW_MS: u64 = 10_000;

/// Ceiling applied to the per-episode hard deadline.
pub const MAX_EPISODE_DEADLINE_MS: u64 = 120_000;

/// Tunables for admission control, leasing, and the main-loop scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StageConfig {
    /// Deduplication window for near-simultaneous non-manual intents.
    pub coalesce_window_ms: u64,
    /// Quiet period armed for (episode, conversation) after each completed
    /// run.
    pub cooldown_ms: u64,
    /// Lifetime of cached results in the idempotency cache.
    pub idempotency_ttl_ms: u64,
    /// Initial lease length of a reservation; the heartbeat renews in these
    /// increments.
    pub reservation_ttl_ms: u64,
    /// Hard deadline for one episode execution.
    pub episode_deadline_ms: u64,
    /// Interval between lease renewals while an episode is in flight.
    pub heartbeat_interval_ms: u64,
    /// Maximum queued items executed per main-loop step.
    pub max_tasks_per_step: usize,
    /// Wall-clock budget for one main-loop drain; the in-flight item may
    /// finish past it, but no new item starts.
    pub max_budget_ms_per_step: u64,
    /// Queued items running longer than this are warn-logged (rate-limited).
    pub long_task_warn_ms: u64,
    /// Queue depth above which a back-pressure warning is logged.
    pub queue_warn_len: usize,
    /// How often (in steps) the expired-ticket sweep runs.
    pub sweep_every_steps: u64,
    /// How often (in steps) registered triggers are scanned.
    pub trigger_scan_every_steps: u64,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            coalesce_window_ms: 300,
            cooldown_ms: 30_000,
            idempotency_ttl_ms: 60_000,
            reservation_ttl_ms: 15_000,
            episode_deadline_ms: 8_000,
            heartbeat_interval_ms: 5_000,
            max_tasks_per_step: 10,
            max_budget_ms_per_step: 4,
            long_task_warn_ms: 2,
            queue_warn_len: 64,
            sweep_every_steps: 120,
            trigger_scan_every_steps: 2_500,
        }
    }
}

impl StageConfig {
    /// Sets the coalescing window, clamped to [`MAX_COALESCE_WINDOW_MS`].
    #[must_use]
    pub const fn with_coalesce_window_ms(mut self, ms: u64) -> Self {
        self.coalesce_window_ms = if ms > MAX_COALESCE_WINDOW_MS {
            MAX_COALESCE_WINDOW_MS
        } else {
            ms
        };
        self
    }

    /// Sets the cooldown duration.
    #[must_use]
    pub const fn with_cooldown_ms(mut self, ms: u64) -> Self {
        self.cooldown_ms = ms;
        self
    }

    /// Sets the idempotency TTL.
    #[must_use]
    pub const fn with_idempotency_ttl_ms(mut self, ms: u64) -> Self {
        self.idempotency_ttl_ms = ms;
        self
    }

    /// Sets the reservation lease length.
    #[must_use]
    pub const fn with_reservation_ttl_ms(mut self, ms: u64) -> Self {
        self.reservation_ttl_ms = ms;
        self
    }

    /// Sets the hard deadline, clamped to [`MAX_EPISODE_DEADLINE_MS`].
    #[must_use]
    pub const fn with_episode_deadline_ms(mut self, ms: u64) -> Self {
        self.episode_deadline_ms = if ms > MAX_EPISODE_DEADLINE_MS {
            MAX_EPISODE_DEADLINE_MS
        } else {
            ms
        };
        self
    }

    /// Sets the heartbeat interval.
    #[must_use]
    pub const fn with_heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.heartbeat_interval_ms = ms;
        self
    }

    /// Sets the per-step task ceiling.
    #[must_use]
    pub const fn with_max_tasks_per_step(mut self, tasks: usize) -> Self {
        self.max_tasks_per_step = tasks;
        self
    }

    /// Sets the per-step wall-clock budget.
    #[must_use]
    pub const fn with_max_budget_ms_per_step(mut self, ms: u64) -> Self {
        self.max_budget_ms_per_step = ms;
        self
    }

    /// Validates cross-field constraints.
    ///
    /// Called once by the composition root; a config that passes here is
    /// never re-checked on the hot path.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_tasks_per_step == 0 {
            return Err(ConfigError::ZeroTaskCeiling);
        }
        if self.reservation_ttl_ms == 0 {
            return Err(ConfigError::ZeroReservationTtl);
        }
        if self.heartbeat_interval_ms >= self.reservation_ttl_ms {
            return Err(ConfigError::HeartbeatSlowerThanLease {
                heartbeat_interval_ms: self.heartbeat_interval_ms,
                reservation_ttl_ms: self.reservation_ttl_ms,
            });
        }
        if self.sweep_every_steps == 0 || self.trigger_scan_every_steps == 0 {
            return Err(ConfigError::ZeroPeriodicInterval);
        }
        Ok(())
    }
}
