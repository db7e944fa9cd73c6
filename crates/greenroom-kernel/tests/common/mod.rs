//! Shared fixtures for integration tests.
#![allow(dead_code)] // each test binary uses a subset of these fixtures

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use greenroom_core::{EpisodeReason, EpisodeRequest, EpisodeResult, ManualClock, StageConfig};
use greenroom_kernel::{Act, BoxFuture, MemoryHistory, Stage};
use tokio_util::sync::CancellationToken;

/// An act that counts executions and completes after a simulated latency,
/// observing cancellation while it waits.
pub struct CountingAct {
    name: String,
    latency_ms: u64,
    executions: AtomicUsize,
}

impl CountingAct {
    pub fn new(name: impl Into<String>, latency_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            latency_ms,
            executions: AtomicUsize::new(0),
        })
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

impl Act for CountingAct {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute<'a>(
        &'a self,
        request: EpisodeRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, EpisodeResult> {
        Box::pin(async move {
            self.executions.fetch_add(1, Ordering::SeqCst);
            tokio::select! {
                () = tokio::time::sleep(std::time::Duration::from_millis(self.latency_ms)) => {
                    EpisodeResult::completed(format!("spoke: {}", request.conv_key), 0)
                }
                () = cancel.cancelled() => EpisodeResult::failed(EpisodeReason::Exception, 0),
            }
        })
    }
}

/// An act that never returns and ignores its cancellation token.
pub struct StuckAct {
    name: String,
}

impl StuckAct {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self { name: name.into() })
    }
}

impl Act for StuckAct {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute<'a>(
        &'a self,
        _request: EpisodeRequest,
        _cancel: CancellationToken,
    ) -> BoxFuture<'a, EpisodeResult> {
        Box::pin(std::future::pending())
    }
}

/// Builds a stage around one act with a manual clock and memory history.
pub fn stage_with_act(
    config: StageConfig,
    act: Arc<dyn Act>,
) -> (Stage, Arc<ManualClock>, Arc<MemoryHistory>) {
    let clock = Arc::new(ManualClock::new(0));
    let history = Arc::new(MemoryHistory::default());
    let stage = Stage::builder()
        .config(config)
        .clock(Arc::clone(&clock) as Arc<dyn greenroom_core::Clock>)
        .history(Arc::clone(&history) as Arc<dyn greenroom_kernel::HistorySink>)
        .act(act)
        .build()
        .expect("stage composition");
    (stage, clock, history)
}

/// Config with admission gates neutralized except the ones a test enables.
pub fn bare_config() -> StageConfig {
    StageConfig::default()
        .with_coalesce_window_ms(0)
        .with_cooldown_ms(0)
        .with_idempotency_ttl_ms(0)
}

/// Lets spawned background tasks make progress.
pub async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}
