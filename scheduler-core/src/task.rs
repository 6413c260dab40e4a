//! `Task`: the abstract worker and the scheduler loop that drives it.
//!
//! The loop is spawned as its own Tokio task per running replica (grounded
//! on the teacher's `spawn_ticker_task`/`execute_single_task` split in
//! `scheduler.rs`: a lightweight timer drives *when*, a spawned task drives
//! the opaque *what* so one slow `execute()` never blocks another
//! replica). `TaskSlot` is the single authoritative record for a replica —
//! it carries the tri-state tag `Registry`'s three logical tables are
//! filtered out of (see `registry.rs`), not three separate maps.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, error, warn};

use crate::config::{GroupName, TaskConfig, TaskId};

/// Per-task statistics, published to the coordination mirror on every
/// transition and updated after every loop iteration.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TaskAnalysis {
    pub executions: u64,
    pub last_run_unix_secs: Option<u64>,
    pub cumulative_runtime_ms: f64,
    pub last_error: Option<String>,
}

/// The shard assignment and identity handed to hook implementations on every
/// call. Built fresh at the start of each loop iteration so a hook always
/// sees an up-to-date `index`/`total`, per spec.md's concurrency note that
/// rebalance is not atomic with respect to a running `execute()`.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub id: TaskId,
    pub group: GroupName,
    pub index: usize,
    pub total: usize,
}

/// User-supplied worker body. The framework owns the loop; implementors only
/// supply the four hooks. Default bodies make `before`/`after`/`destroy`
/// optional, matching tasks that only care about `execute`.
#[async_trait]
pub trait TaskHooks: Send + Sync {
    async fn before(&self, _ctx: &TaskContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn execute(&self, ctx: &TaskContext) -> anyhow::Result<()>;

    async fn after(&self, _ctx: &TaskContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn destroy(&self, _ctx: &TaskContext) -> anyhow::Result<()> {
        Ok(())
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Started = 0,
    Stopping = 1,
    Stopped = 2,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TaskState::Started,
            1 => TaskState::Stopping,
            _ => TaskState::Stopped,
        }
    }
}

struct AtomicTaskState(AtomicU8);

impl AtomicTaskState {
    fn new(state: TaskState) -> Self {
        AtomicTaskState(AtomicU8::new(state as u8))
    }

    fn load(&self) -> TaskState {
        TaskState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn store(&self, state: TaskState) {
        self.0.store(state as u8, Ordering::Release)
    }
}

/// The single authoritative record for one replica: immutable configuration,
/// the mutable shard assignment, the three lifecycle flags from spec.md §3
/// (`close`/`closed`/`remove`), and the notify primitive `thisNotify` wakes.
pub struct TaskSlot {
    pub config: TaskConfig,
    index: AtomicUsize,
    total: AtomicUsize,
    state: AtomicTaskState,
    close: AtomicBool,
    closed: AtomicBool,
    remove: AtomicBool,
    notify: Notify,
    analysis: Mutex<TaskAnalysis>,
    hooks: Arc<dyn TaskHooks>,
}

impl fmt::Debug for TaskSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSlot")
            .field("id", &self.config.id)
            .field("state", &self.state.load())
            .field("index", &self.index())
            .field("total", &self.total())
            .finish()
    }
}

impl TaskSlot {
    /// A freshly registered task starts in `stopped`, `close=true`,
    /// `closed=true` (spec.md §3, Task lifecycle step 1).
    pub fn new(config: TaskConfig, hooks: Arc<dyn TaskHooks>) -> Arc<Self> {
        Arc::new(TaskSlot {
            config,
            index: AtomicUsize::new(0),
            total: AtomicUsize::new(1),
            state: AtomicTaskState::new(TaskState::Stopped),
            close: AtomicBool::new(true),
            closed: AtomicBool::new(true),
            remove: AtomicBool::new(false),
            notify: Notify::new(),
            analysis: Mutex::new(TaskAnalysis::default()),
            hooks,
        })
    }

    pub fn id(&self) -> &TaskId {
        &self.config.id
    }

    pub fn group(&self) -> &GroupName {
        &self.config.group
    }

    pub fn index(&self) -> usize {
        self.index.load(Ordering::Acquire)
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    pub(crate) fn set_index_total(&self, index: usize, total: usize) {
        self.index.store(index, Ordering::Release);
        self.total.store(total, Ordering::Release);
    }

    pub fn state(&self) -> TaskState {
        self.state.load()
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.store(state)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_close_requested(&self) -> bool {
        self.close.load(Ordering::Acquire)
    }

    pub fn is_marked_for_removal(&self) -> bool {
        self.remove.load(Ordering::Acquire)
    }

    /// Daemon replicas (spec.md §4.2: "should not prevent process exit") are
    /// skipped by `Registry::close_all`/`close_group` and by
    /// `Lifecycle::shutdown`'s drain-wait — only an explicit `close(id)`
    /// reaches them.
    pub fn is_daemon(&self) -> bool {
        self.config.daemon
    }

    pub(crate) fn mark_for_removal(&self) {
        self.remove.store(true, Ordering::Release);
    }

    /// `thisNotify`: wakes one waiting iteration of the scheduler loop
    /// immediately. Safe to call when nothing is waiting — the permit is
    /// retained for the next `wait` call (spec.md §5: "both [suspension
    /// points] are interruptible by thisNotify").
    pub fn notify_waiter(&self) {
        self.notify.notify_one();
    }

    pub fn analysis_snapshot(&self) -> TaskAnalysis {
        self.analysis.lock().expect("analysis mutex poisoned").clone()
    }

    /// Shares this slot's hook implementation, used when `Registry::append`
    /// stamps out a new replica that must run the same worker body.
    pub(crate) fn hooks_handle(&self) -> Arc<dyn TaskHooks> {
        self.hooks.clone()
    }

    fn context(&self) -> TaskContext {
        TaskContext {
            id: self.config.id.clone(),
            group: self.config.group.clone(),
            index: self.index(),
            total: self.total(),
        }
    }

    /// `start(id)`: moved to `started`, `close=false` (the spawn itself and
    /// the `started` registry transition are `Registry`'s job).
    pub(crate) fn prepare_for_start(&self) {
        self.close.store(false, Ordering::Release);
        self.closed.store(false, Ordering::Release);
        self.state.store(TaskState::Started);
    }

    /// `close(id)`: sets `close=true` unconditionally (idempotent).
    pub(crate) fn request_close(&self) {
        self.close.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

async fn wait_or_notify_until(slot: &TaskSlot, until: SystemTime) {
    let now = SystemTime::now();
    let dur = until.duration_since(now).unwrap_or(Duration::ZERO);
    tokio::select! {
        _ = tokio::time::sleep(dur) => {},
        _ = slot.notify.notified() => {},
    }
}

async fn sleep_or_notify(slot: &TaskSlot, dur: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(dur) => {},
        _ = slot.notify.notified() => {},
    }
}

/// The scheduler loop from spec.md §4.2, run to completion by a single
/// spawned Tokio task per replica. `close` is purely cooperative: there is
/// no forced interruption of `execute()`.
pub(crate) async fn run_loop(slot: Arc<TaskSlot>) {
    let mut invocations: u64 = 0;

    loop {
        if slot.is_close_requested() {
            break;
        }

        if let Some(schedule) = slot.config.schedule.clone() {
            // Non-lazy tasks fire immediately on their first iteration;
            // lazy tasks (and every iteration after the first) wait for the
            // next scheduled instant. See SPEC_FULL.md §3's resolution of
            // the "does lazy gate before()" ambiguity.
            if invocations > 0 || slot.config.lazy {
                let now = SystemTime::now();
                match schedule.next_after(now) {
                    Some(next) => wait_or_notify_until(&slot, next).await,
                    None => break,
                }
                if slot.is_close_requested() {
                    break;
                }
            }
        }

        let ctx = slot.context();
        let iteration_start = std::time::Instant::now();
        let will_close_after_this =
            slot.config.run_limit > 0 && invocations + 1 >= slot.config.run_limit;

        let run_before = !slot.config.before_after_only || invocations == 0;
        let run_after = !slot.config.before_after_only || will_close_after_this;

        if run_before {
            if let Err(e) = slot.hooks.before(&ctx).await {
                record_failure(&slot, &ctx, "before", &e);
            }
        }

        match slot.hooks.execute(&ctx).await {
            Ok(()) => {
                debug!(task = %ctx.id, "execute completed");
            }
            Err(e) => record_failure(&slot, &ctx, "execute", &e),
        }

        if run_after {
            if let Err(e) = slot.hooks.after(&ctx).await {
                record_failure(&slot, &ctx, "after", &e);
            }
        }

        record_iteration(&slot, iteration_start.elapsed());
        invocations += 1;

        if will_close_after_this {
            slot.close.store(true, Ordering::Release);
        }

        if slot.config.schedule.is_none() && slot.config.interval > Duration::ZERO {
            sleep_or_notify(&slot, slot.config.interval).await;
        }
    }

    slot.closed.store(true, Ordering::Release);

    let ctx = slot.context();
    if let Err(e) = slot.hooks.destroy(&ctx).await {
        warn!(task = %ctx.id, error = %e, "destroy() failed");
    }
}

fn record_iteration(slot: &TaskSlot, elapsed: Duration) {
    let mut analysis = slot.analysis.lock().expect("analysis mutex poisoned");
    analysis.executions += 1;
    analysis.last_run_unix_secs = Some(
        SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
    );
    analysis.cumulative_runtime_ms += elapsed.as_secs_f64() * 1000.0;
}

fn record_failure(slot: &TaskSlot, ctx: &TaskContext, hook: &str, err: &anyhow::Error) {
    error!(task = %ctx.id, hook, error = %err, "task hook failed");
    let mut analysis = slot.analysis.lock().expect("analysis mutex poisoned");
    analysis.last_error = Some(format!("{hook}: {err}"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::testing::ImmediateSchedule;
    use std::sync::atomic::AtomicU64;

    struct CountingTask {
        calls: Arc<AtomicU64>,
    }

    #[async_trait]
    impl TaskHooks for CountingTask {
        async fn execute(&self, _ctx: &TaskContext) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn run_limit_stops_the_loop() {
        let calls = Arc::new(AtomicU64::new(0));
        let config = TaskConfig::new(
            TaskId::from("g-0"),
            GroupName::from("g"),
            Some(Arc::new(ImmediateSchedule)),
            Duration::ZERO,
            3,
            false,
            false,
            false,
        );
        let slot = TaskSlot::new(
            config,
            Arc::new(CountingTask {
                calls: calls.clone(),
            }),
        );
        slot.prepare_for_start();
        run_loop(slot.clone()).await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(slot.is_closed());
        assert_eq!(slot.analysis_snapshot().executions, 3);
    }

    #[tokio::test]
    async fn close_breaks_the_loop_without_forcing_execute() {
        let calls = Arc::new(AtomicU64::new(0));
        let config = TaskConfig::new(
            TaskId::from("g-0"),
            GroupName::from("g"),
            None,
            Duration::from_secs(3600),
            0,
            false,
            false,
            false,
        );
        let slot = TaskSlot::new(
            config,
            Arc::new(CountingTask {
                calls: calls.clone(),
            }),
        );
        slot.prepare_for_start();
        let handle = tokio::spawn(run_loop(slot.clone()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        slot.request_close();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop should exit promptly once notified")
            .unwrap();

        assert!(slot.is_closed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
