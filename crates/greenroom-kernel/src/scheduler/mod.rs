//! Main-loop scheduler.
//!
//! The only bridge from background execution into the authoritative-state
//! context. Background tasks enqueue callbacks here; the host drains the
//! queue by calling [`MainLoopScheduler::process_frame`] exactly once per
//! simulated step, under a task-count and wall-clock budget, so episode
//! bookkeeping can never stall a frame.
//!
//! # Architecture
//!
//! ```text
//! MainLoopScheduler (Clone; shared handle)
//!     ├── queue: Mutex<VecDeque<WorkItem>>        // drained per frame
//!     ├── delays: Mutex<Vec<DelayItem>>           // step-based suspensions
//!     ├── periodics: Mutex<Vec<PeriodicItem>>     // recurring step work
//!     └── warned_at: Mutex<HashMap<label, step>>  // log rate limiting
//! ```
//!
//! # Ordering
//!
//! Queued items execute in enqueue order within a drain. A drain may span
//! multiple steps when the budget is exceeded, so the only cross-frame
//! guarantee is that no item starts before an earlier-enqueued item has
//! started.
//!
//! # Failure containment
//!
//! A panicking callback is caught, error-logged, and the drain continues. A
//! cancelled item is skipped silently and does not count against the frame's
//! task budget.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use greenroom_core::StageConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// Minimum steps between repeated long-task warnings for one label.
pub const LONG_TASK_WARN_INTERVAL_STEPS: u64 = 600;

/// Bound on the rate-limiter map; it is cleared wholesale when exceeded.
const MAX_WARN_LABELS: usize = 1_024;

/// Per-frame budget and warning thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Maximum queued items executed per frame.
    pub max_tasks_per_step: usize,
    /// Wall-clock drain budget per frame; the in-flight item may finish past
    /// it, but no new item starts.
    pub max_budget_ms_per_step: u64,
    /// Items running longer than this are warn-logged (rate-limited per
    /// label).
    pub long_task_warn_ms: u64,
    /// Queue depth above which a back-pressure warning is logged. Items are
    /// never dropped.
    pub queue_warn_len: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_tasks_per_step: 10,
            max_budget_ms_per_step: 4,
            long_task_warn_ms: 2,
            queue_warn_len: 64,
        }
    }
}

impl From<&StageConfig> for SchedulerConfig {
    fn from(config: &StageConfig) -> Self {
        Self {
            max_tasks_per_step: config.max_tasks_per_step,
            max_budget_ms_per_step: config.max_budget_ms_per_step,
            long_task_warn_ms: config.long_task_warn_ms,
            queue_warn_len: config.queue_warn_len,
        }
    }
}

/// Scheduler-side failures surfaced to awaiting callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum SchedulerError {
    /// The queued task never produced a value: it panicked, was cancelled,
    /// or the scheduler was dropped before a frame ran it.
    #[error("main-loop task {label} was dropped before completing")]
    TaskDropped {
        /// Label the task was enqueued under.
        label: String,
    },
}

struct WorkItem {
    label: String,
    cancel: Option<CancellationToken>,
    callback: Box<dyn FnOnce() + Send>,
}

struct DelayItem {
    steps: u64,
    /// Bound on first frame observation: `observed_step + steps`. Binding
    /// lazily means a late-registered item never fires immediately off
    /// stale time math.
    target_step: Option<u64>,
    tx: oneshot::Sender<()>,
}

struct PeriodicItem {
    name: String,
    every_steps: u64,
    initial_delay_steps: u64,
    /// Bound on first frame observation, then advanced from the last
    /// *scheduled* step so drift never accumulates beyond one step. Missed
    /// intervals (host frame gaps) are skipped, not replayed.
    next_due: Option<u64>,
    callback: Arc<dyn Fn() + Send + Sync>,
    cancelled: Arc<AtomicBool>,
}

/// Disposable registration handle for periodic work.
///
/// Dropping the handle cancels the registration.
#[derive(Debug)]
pub struct PeriodicHandle {
    name: String,
    cancelled: Arc<AtomicBool>,
}

impl PeriodicHandle {
    /// Name the work was registered under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cancels the registration; the callback will not be enqueued again.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

impl Drop for PeriodicHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// What one frame did; returned to the host for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameReport {
    /// The step this frame ran at.
    pub step: u64,
    /// Queued items executed.
    pub executed: usize,
    /// Cancelled items skipped (not counted against the budget).
    pub skipped_cancelled: usize,
    /// Delay waiters signaled.
    pub delays_fired: usize,
    /// Periodic callbacks enqueued.
    pub periodics_enqueued: usize,
    /// Items left queued after the drain.
    pub remaining_queue: usize,
}

struct SchedulerInner {
    config: SchedulerConfig,
    queue: Mutex<VecDeque<WorkItem>>,
    delays: Mutex<Vec<DelayItem>>,
    periodics: Mutex<Vec<PeriodicItem>>,
    current_step: AtomicU64,
    warned_at: Mutex<HashMap<String, u64>>,
}

/// Shared handle to the main-loop work queue.
#[derive(Clone)]
pub struct MainLoopScheduler {
    inner: Arc<SchedulerInner>,
}

impl std::fmt::Debug for MainLoopScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainLoopScheduler")
            .field("config", &self.inner.config)
            .field("queue_len", &self.queue_len())
            .finish_non_exhaustive()
    }
}

impl MainLoopScheduler {
    /// Creates a scheduler with the given frame budget.
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                queue: Mutex::new(VecDeque::new()),
                delays: Mutex::new(Vec::new()),
                periodics: Mutex::new(Vec::new()),
                current_step: AtomicU64::new(0),
                warned_at: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The step of the most recent frame.
    pub fn current_step(&self) -> u64 {
        self.inner.current_step.load(Ordering::SeqCst)
    }

    /// Items currently queued.
    pub fn queue_len(&self) -> usize {
        self.inner.queue.lock().expect("lock poisoned").len()
    }

    /// Enqueues a callback to run once on the main loop.
    pub fn run_on_main_loop<F>(&self, label: impl Into<String>, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(label.into(), None, Box::new(callback));
    }

    /// Enqueues a callback that is skipped silently if `cancel` fires before
    /// a frame reaches it.
    pub fn run_on_main_loop_cancellable<F>(
        &self,
        label: impl Into<String>,
        cancel: CancellationToken,
        callback: F,
    ) where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(label.into(), Some(cancel), Box::new(callback));
    }

    /// Enqueues a callback and suspends until it has run, yielding its value.
    ///
    /// A panicking callback (or a scheduler dropped before the next frame)
    /// surfaces as [`SchedulerError::TaskDropped`].
    pub async fn run_on_main_loop_async<T, F>(
        &self,
        label: impl Into<String>,
        callback: F,
    ) -> Result<T, SchedulerError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let label = label.into();
        let (tx, rx) = oneshot::channel();
        self.enqueue(
            label.clone(),
            None,
            Box::new(move || {
                let _ = tx.send(callback());
            }),
        );
        rx.await.map_err(|_| SchedulerError::TaskDropped { label })
    }

    /// Suspends until at least `steps` frames have run after the first frame
    /// that observes this item.
    ///
    /// Dropping the returned future cancels the delay; the frame discards it
    /// without signaling.
    pub async fn delay_steps(&self, steps: u64) {
        let (tx, rx) = oneshot::channel();
        {
            let mut delays = self.inner.delays.lock().expect("lock poisoned");
            delays.push(DelayItem {
                steps,
                target_step: None,
                tx,
            });
        }
        let _ = rx.await;
    }

    /// Registers recurring work.
    ///
    /// First run at `first observed frame + initial_delay_steps`, then every
    /// `every_steps`, executed as ordinary queued items so the frame budget
    /// applies. The returned handle cancels on [`PeriodicHandle::cancel`] or
    /// drop.
    #[must_use]
    pub fn schedule_periodic<F>(
        &self,
        name: impl Into<String>,
        every_steps: u64,
        initial_delay_steps: u64,
        callback: F,
    ) -> PeriodicHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        let name = name.into();
        let cancelled = Arc::new(AtomicBool::new(false));
        {
            let mut periodics = self.inner.periodics.lock().expect("lock poisoned");
            periodics.push(PeriodicItem {
                name: name.clone(),
                every_steps: every_steps.max(1),
                initial_delay_steps,
                next_due: None,
                callback: Arc::new(callback),
                cancelled: Arc::clone(&cancelled),
            });
        }
        debug!(name = %name, every_steps, "registered periodic task");
        PeriodicHandle { name, cancelled }
    }

    /// Runs one frame: resolves due delays, enqueues due periodic work, and
    /// drains the queue under the frame budget.
    ///
    /// Must be invoked exactly once per main-loop advance, from the host's
    /// authoritative-state context.
    pub fn process_frame(&self, current_step: u64) -> FrameReport {
        self.inner.current_step.store(current_step, Ordering::SeqCst);

        let delays_fired = self.fire_due_delays(current_step);
        let periodics_enqueued = self.enqueue_due_periodics(current_step);
        let (executed, skipped_cancelled) = self.drain_queue(current_step);

        let remaining_queue = self.queue_len();
        if remaining_queue > self.inner.config.queue_warn_len
            && self.should_warn("main-loop-queue-depth", current_step)
        {
            warn!(
                queue_len = remaining_queue,
                limit = self.inner.config.queue_warn_len,
                "main-loop queue is backed up"
            );
        }

        FrameReport {
            step: current_step,
            executed,
            skipped_cancelled,
            delays_fired,
            periodics_enqueued,
            remaining_queue,
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn enqueue(&self, label: String, cancel: Option<CancellationToken>, callback: Box<dyn FnOnce() + Send>) {
        let mut queue = self.inner.queue.lock().expect("lock poisoned");
        trace!(label = %label, queue_len = queue.len() + 1, "enqueued main-loop item");
        queue.push_back(WorkItem {
            label,
            cancel,
            callback,
        });
    }

    fn fire_due_delays(&self, current_step: u64) -> usize {
        let mut delays = self.inner.delays.lock().expect("lock poisoned");
        let mut fired = 0;
        let mut kept = Vec::with_capacity(delays.len());
        for mut item in delays.drain(..) {
            if item.tx.is_closed() {
                // Waiter dropped its future; discard without signaling.
                continue;
            }
            let target = *item
                .target_step
                .get_or_insert(current_step.saturating_add(item.steps));
            if current_step >= target {
                let _ = item.tx.send(());
                fired += 1;
            } else {
                kept.push(item);
            }
        }
        *delays = kept;
        fired
    }

    fn enqueue_due_periodics(&self, current_step: u64) -> usize {
        let due: Vec<(String, Arc<dyn Fn() + Send + Sync>, Arc<AtomicBool>)> = {
            let mut periodics = self.inner.periodics.lock().expect("lock poisoned");
            periodics.retain(|item| !item.cancelled.load(Ordering::SeqCst));

            let mut due = Vec::new();
            for item in periodics.iter_mut() {
                let next_due = *item
                    .next_due
                    .get_or_insert(current_step.saturating_add(item.initial_delay_steps));
                if current_step >= next_due {
                    due.push((
                        item.name.clone(),
                        Arc::clone(&item.callback),
                        Arc::clone(&item.cancelled),
                    ));
                    // Re-anchor from the scheduled step, skipping any
                    // intervals the host never stepped through.
                    let mut next = next_due;
                    while next <= current_step {
                        next = next.saturating_add(item.every_steps);
                    }
                    item.next_due = Some(next);
                }
            }
            due
        };

        let enqueued = due.len();
        for (name, callback, cancelled) in due {
            self.enqueue(
                name,
                None,
                Box::new(move || {
                    // Cancellation between enqueue and execution.
                    if !cancelled.load(Ordering::SeqCst) {
                        callback();
                    }
                }),
            );
        }
        enqueued
    }

    fn drain_queue(&self, current_step: u64) -> (usize, usize) {
        let config = &self.inner.config;
        let drain_start = Instant::now();
        let budget = Duration::from_millis(config.max_budget_ms_per_step);
        let mut executed = 0usize;
        let mut skipped = 0usize;

        loop {
            if executed >= config.max_tasks_per_step {
                break;
            }
            if drain_start.elapsed() > budget {
                trace!(executed, "frame budget exceeded; deferring remainder");
                break;
            }
            let Some(item) = self.inner.queue.lock().expect("lock poisoned").pop_front() else {
                break;
            };
            if item
                .cancel
                .as_ref()
                .is_some_and(CancellationToken::is_cancelled)
            {
                skipped += 1;
                continue;
            }

            let item_start = Instant::now();
            let outcome = catch_unwind(AssertUnwindSafe(item.callback));
            if outcome.is_err() {
                error!(label = %item.label, "main-loop item panicked");
            }

            let elapsed_ms = item_start.elapsed().as_millis() as u64;
            if elapsed_ms > config.long_task_warn_ms && self.should_warn(&item.label, current_step)
            {
                warn!(
                    label = %item.label,
                    elapsed_ms,
                    threshold_ms = config.long_task_warn_ms,
                    "long-running main-loop item"
                );
            }
            executed += 1;
        }
        (executed, skipped)
    }

    /// Rate-limits a warning per label to once per
    /// [`LONG_TASK_WARN_INTERVAL_STEPS`].
    fn should_warn(&self, label: &str, current_step: u64) -> bool {
        let mut warned_at = self.inner.warned_at.lock().expect("lock poisoned");
        if warned_at.len() > MAX_WARN_LABELS {
            warned_at.clear();
        }
        match warned_at.get(label) {
            Some(last) if current_step.saturating_sub(*last) < LONG_TASK_WARN_INTERVAL_STEPS => {
                false
            }
            _ => {
                warned_at.insert(label.to_string(), current_step);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn scheduler() -> MainLoopScheduler {
        MainLoopScheduler::new(SchedulerConfig::default())
    }

    #[test]
    fn test_items_run_in_enqueue_order() {
        let sched = scheduler();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            sched.run_on_main_loop(format!("item-{i}"), move || {
                order.lock().unwrap().push(i);
            });
        }
        let report = sched.process_frame(1);
        assert_eq!(report.executed, 3);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_task_ceiling_defers_remainder() {
        let sched = MainLoopScheduler::new(SchedulerConfig {
            max_tasks_per_step: 10,
            max_budget_ms_per_step: 10_000,
            ..SchedulerConfig::default()
        });
        let ran = Arc::new(AtomicUsize::new(0));
        for i in 0..25 {
            let ran = Arc::clone(&ran);
            sched.run_on_main_loop(format!("item-{i}"), move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }

        let report = sched.process_frame(1);
        assert_eq!(report.executed, 10);
        assert_eq!(report.remaining_queue, 15);
        assert_eq!(ran.load(Ordering::SeqCst), 10);

        sched.process_frame(2);
        let report = sched.process_frame(3);
        assert_eq!(report.executed, 5);
        assert_eq!(ran.load(Ordering::SeqCst), 25);
    }

    #[test]
    fn test_panicking_item_does_not_halt_drain() {
        let sched = scheduler();
        let ran = Arc::new(AtomicBool::new(false));
        sched.run_on_main_loop("boom", || panic!("scripted failure"));
        {
            let ran = Arc::clone(&ran);
            sched.run_on_main_loop("after", move || {
                ran.store(true, Ordering::SeqCst);
            });
        }
        let report = sched.process_frame(1);
        assert_eq!(report.executed, 2);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_cancelled_item_skipped_silently() {
        let sched = scheduler();
        let ran = Arc::new(AtomicBool::new(false));
        let token = CancellationToken::new();
        {
            let ran = Arc::clone(&ran);
            sched.run_on_main_loop_cancellable("cancelled", token.clone(), move || {
                ran.store(true, Ordering::SeqCst);
            });
        }
        token.cancel();
        let report = sched.process_frame(1);
        assert_eq!(report.executed, 0);
        assert_eq!(report.skipped_cancelled, 1);
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_run_async_yields_value() {
        let sched = scheduler();
        let waiter = {
            let sched = sched.clone();
            tokio::spawn(async move { sched.run_on_main_loop_async("calc", || 6 * 7).await })
        };
        tokio::task::yield_now().await;
        sched.process_frame(1);
        assert_eq!(waiter.await.unwrap().unwrap(), 42);
    }

    #[tokio::test]
    async fn test_run_async_panic_surfaces_as_error() {
        let sched = scheduler();
        let waiter = {
            let sched = sched.clone();
            tokio::spawn(async move {
                sched
                    .run_on_main_loop_async("boom", || -> u32 { panic!("scripted failure") })
                    .await
            })
        };
        tokio::task::yield_now().await;
        sched.process_frame(1);
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, SchedulerError::TaskDropped { .. }));
    }

    #[tokio::test]
    async fn test_delay_binds_target_lazily() {
        let sched = scheduler();
        // Frames 1..=10 happen before the delay is registered; a stale-math
        // implementation would fire immediately.
        for step in 1..=10 {
            sched.process_frame(step);
        }

        let waiter = {
            let sched = sched.clone();
            tokio::spawn(async move {
                sched.delay_steps(2).await;
            })
        };
        tokio::task::yield_now().await;

        let report = sched.process_frame(11); // binds target = 13
        assert_eq!(report.delays_fired, 0);
        sched.process_frame(12);
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        let report = sched.process_frame(13);
        assert_eq!(report.delays_fired, 1);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_delay_discarded_without_signal() {
        let sched = scheduler();
        let waiter = {
            let sched = sched.clone();
            tokio::spawn(async move {
                sched.delay_steps(5).await;
            })
        };
        tokio::task::yield_now().await;
        waiter.abort();
        let _ = waiter.await;

        let report = sched.process_frame(1);
        assert_eq!(report.delays_fired, 0);
        // The cancelled item is gone entirely.
        let report = sched.process_frame(100);
        assert_eq!(report.delays_fired, 0);
    }

    #[test]
    fn test_periodic_schedule_and_cadence() {
        let sched = scheduler();
        let ran = Arc::new(AtomicUsize::new(0));
        let handle = {
            let ran = Arc::clone(&ran);
            sched.schedule_periodic("pulse", 5, 2, move || {
                ran.fetch_add(1, Ordering::SeqCst);
            })
        };

        // First observed at step 1 -> first due at 3, then 8, 13, ...
        for step in 1..=13 {
            sched.process_frame(step);
        }
        assert_eq!(ran.load(Ordering::SeqCst), 3);

        handle.cancel();
        for step in 14..=30 {
            sched.process_frame(step);
        }
        assert_eq!(ran.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_periodic_skips_missed_intervals() {
        let sched = scheduler();
        let ran = Arc::new(AtomicUsize::new(0));
        let _handle = {
            let ran = Arc::clone(&ran);
            sched.schedule_periodic("pulse", 10, 0, move || {
                ran.fetch_add(1, Ordering::SeqCst);
            })
        };

        sched.process_frame(1); // due immediately
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        // Host skips 40 steps: one catch-up run, not four.
        sched.process_frame(41);
        assert_eq!(ran.load(Ordering::SeqCst), 2);
        // Re-anchored to 51.
        sched.process_frame(50);
        assert_eq!(ran.load(Ordering::SeqCst), 2);
        sched.process_frame(51);
        assert_eq!(ran.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_dropped_handle_cancels_periodic() {
        let sched = scheduler();
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let ran = Arc::clone(&ran);
            let _handle = sched.schedule_periodic("pulse", 1, 0, move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
            // handle dropped here
        }
        sched.process_frame(1);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_periodic_work_respects_frame_budget() {
        let sched = MainLoopScheduler::new(SchedulerConfig {
            max_tasks_per_step: 1,
            max_budget_ms_per_step: 10_000,
            ..SchedulerConfig::default()
        });
        let ran = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for i in 0..3 {
            let ran = Arc::clone(&ran);
            handles.push(sched.schedule_periodic(format!("pulse-{i}"), 100, 0, move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }

        // All three become due on the first frame but only one may execute.
        let report = sched.process_frame(1);
        assert_eq!(report.periodics_enqueued, 3);
        assert_eq!(report.executed, 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
