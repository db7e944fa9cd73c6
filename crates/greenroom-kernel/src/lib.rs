//! # greenroom-kernel
//!
//! Admission control, resource leasing, and main-loop scheduling for
//! conversational episodes hosted inside a real-time simulation.
//!
//! The host advances in discrete steps with a hard per-step budget, and its
//! authoritative state may only be touched from that context. Episodes are
//! long-running (they call out to a remote generation service) and must
//! never block a step, yet they need exclusive access to the conversation
//! and participants they involve. This crate is the machinery between those
//! two worlds:
//!
//! - [`reservation::ReservationKernel`] — grants time-bounded tickets with
//!   mutual exclusion across conversation keys and participants, plus the
//!   coalescing, cooldown, and idempotency gates around admission
//! - [`scheduler::MainLoopScheduler`] — the only bridge from background
//!   tasks back into the host's step context, drained under a per-step
//!   task-count and wall-clock budget
//! - [`coordinator::StageCoordinator`] — the admission pipeline and the
//!   deadline-raced, heartbeat-renewed execution driver
//! - [`act::Act`] / [`trigger::Trigger`] — the pluggable contracts for
//!   episode content and intent production
//! - [`stage::Stage`] — the composition root wiring all of the above
//!
//! # Runtime requirements
//!
//! Episode execution, heartbeats, and trigger scans are spawned onto the
//! ambient tokio runtime; [`stage::StageBuilder::build`] must run inside
//! one. [`scheduler::MainLoopScheduler::process_frame`] itself is a plain
//! synchronous call made from the host's own loop.

pub mod act;
pub mod coordinator;
pub mod history;
pub mod reservation;
pub mod scheduler;
pub mod stage;
pub mod trigger;

pub use act::{Act, ActRegistry, BoxFuture, ScriptedAct};
pub use coordinator::{RunningEpisode, StageCoordinator};
pub use history::{HistoryEntry, HistoryError, HistorySink, MemoryHistory, NullHistory};
pub use reservation::{Coalescer, CooldownTracker, IdempotencyCache, KernelStats, ReservationKernel};
pub use scheduler::{
    FrameReport, MainLoopScheduler, PeriodicHandle, SchedulerConfig, SchedulerError,
};
pub use stage::{Stage, StageBuilder};
pub use trigger::{
    fixed_candidates, BusyProbe, CandidateFn, ManualTrigger, RandomEncounterTrigger, SubmitHandle,
    Trigger, TriggerSet,
};
