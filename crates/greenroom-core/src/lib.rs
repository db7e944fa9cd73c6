//! # greenroom-core
//!
//! Domain contracts for the greenroom stage orchestration kernel.
//!
//! This crate defines the pure data model shared between the reservation
//! kernel, the main-loop scheduler, and the stage coordinator:
//!
//! - [`ConvKey`] / [`ParticipantId`]: deterministic conversation identity
//!   derived from a participant set
//! - [`Intent`] / [`Decision`]: a requested episode run and the admission
//!   verdict returned for it
//! - [`Ticket`]: a time-bounded exclusive-access lease over a conversation
//!   and its participants
//! - [`EpisodeRequest`] / [`EpisodeResult`]: the execution contract between
//!   the coordinator and a registered act
//! - [`Fingerprint`]: the idempotency key for a request
//! - [`StageConfig`]: every tunable read by the runtime
//! - [`Clock`]: explicit time injection so kernel state is testable without
//!   wall-clock sleeps
//!
//! Nothing in this crate spawns tasks or owns locks; the runtime half of the
//! system lives in `greenroom-kernel`.

pub mod clock;
pub mod config;
pub mod conv_key;
pub mod episode;
pub mod error;
pub mod fingerprint;
pub mod intent;
pub mod ticket;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::StageConfig;
pub use conv_key::{ConvKey, ParticipantId};
pub use episode::{EpisodeReason, EpisodeRequest, EpisodeResult, FALLBACK_TEXT};
pub use error::{CompositionError, ConfigError, LeaseError, ReserveRefused};
pub use fingerprint::Fingerprint;
pub use intent::{Decision, DecisionOutcome, Intent, IntentOrigin, RejectReason};
pub use ticket::{ResourceClaim, Ticket, TicketId, TicketState};
