//! Act contract and registry.
//!
//! An *act* is the pluggable unit of work the coordinator invokes once a
//! reservation is granted: it turns an [`EpisodeRequest`] into an
//! [`EpisodeResult`], typically by calling out to a remote generation
//! service. The kernel depends only on this execution contract, never on an
//! act's content logic.
//!
//! # Execution contract
//!
//! - Observe the cancellation token promptly; the hard-deadline path cancels
//!   it and walks away without waiting.
//! - Do not retain the ticket id past your own return.
//! - Returning an `EpisodeResult` is preferred over panicking; the
//!   coordinator tolerates a panic but normalizes it to an exception result.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use greenroom_core::{CompositionError, EpisodeRequest, EpisodeResult};
use tokio_util::sync::CancellationToken;

/// Maximum registered acts.
pub const MAX_ACTS: usize = 64;

/// Boxed future type used by the object-safe [`Act`] and
/// [`Trigger`](crate::trigger::Trigger) traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A pluggable episode handler.
pub trait Act: Send + Sync {
    /// Episode name this act serves.
    fn name(&self) -> &str;

    /// Whether this act will take the request. A refusal becomes a
    /// `Rejected` episode result without execution.
    fn is_eligible(&self, request: &EpisodeRequest) -> bool {
        let _ = request;
        true
    }

    /// Runs one episode. The returned result's latency field is stamped by
    /// the coordinator; acts may leave it zero.
    fn execute<'a>(
        &'a self,
        request: EpisodeRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, EpisodeResult>;

    /// Called once when the stage is composed.
    fn on_enable(&self) {}

    /// Called once when the stage shuts down.
    fn on_disable(&self) {}
}

/// Registry of acts keyed by episode name.
///
/// Duplicate names are a composition error: two acts silently shadowing each
/// other is exactly the kind of wiring mistake the composition root exists
/// to catch.
#[derive(Default)]
pub struct ActRegistry {
    acts: HashMap<String, Arc<dyn Act>>,
}

impl ActRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an act under its own name.
    pub fn register(&mut self, act: Arc<dyn Act>) -> Result<(), CompositionError> {
        if self.acts.len() >= MAX_ACTS {
            return Err(CompositionError::RegistryFull {
                what: "acts",
                max: MAX_ACTS,
            });
        }
        let name = act.name().to_string();
        if self.acts.contains_key(&name) {
            return Err(CompositionError::DuplicateAct { name });
        }
        self.acts.insert(name, act);
        Ok(())
    }

    /// Looks up an act by episode name.
    #[must_use]
    pub fn get(&self, episode: &str) -> Option<Arc<dyn Act>> {
        self.acts.get(episode).cloned()
    }

    /// Returns `true` if an act serves this episode name.
    #[must_use]
    pub fn contains(&self, episode: &str) -> bool {
        self.acts.contains_key(episode)
    }

    /// Registered episode names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.acts.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered acts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.acts.len()
    }

    /// Returns `true` if no acts are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.acts.is_empty()
    }

    /// Iterates over registered acts.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Act>> {
        self.acts.values()
    }
}

impl std::fmt::Debug for ActRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActRegistry").field("names", &self.names()).finish()
    }
}

/// A canned act: waits a fixed simulated latency, then returns a scripted
/// line. Observes cancellation while waiting.
///
/// Useful as a smoke-test handler and in integration tests.
pub struct ScriptedAct {
    name: String,
    line: String,
    latency_ms: u64,
}

impl ScriptedAct {
    /// Creates a scripted act.
    pub fn new(name: impl Into<String>, line: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            name: name.into(),
            line: line.into(),
            latency_ms,
        }
    }
}

impl Act for ScriptedAct {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute<'a>(
        &'a self,
        _request: EpisodeRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, EpisodeResult> {
        Box::pin(async move {
            tokio::select! {
                () = tokio::time::sleep(std::time::Duration::from_millis(self.latency_ms)) => {
                    EpisodeResult::completed(self.line.clone(), 0)
                }
                () = cancel.cancelled() => {
                    EpisodeResult::failed(greenroom_core::EpisodeReason::Exception, 0)
                }
            }
        })
    }
}
