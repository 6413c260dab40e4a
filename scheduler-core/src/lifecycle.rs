//! `Lifecycle`: the shutdown sequence of spec.md §4.5, grounded closely on
//! the teacher's `TaskScheduler::stop()` in `agent/src/scheduler.rs` —
//! signal a close to everything in flight, then poll a deadline, re-waking
//! waiters on every cycle instead of just sleeping through it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::registry::Registry;

pub struct Lifecycle {
    registry: Arc<Registry>,
    shutdown_timeout: Duration,
}

impl Lifecycle {
    pub fn new(registry: Arc<Registry>, shutdown_timeout: Duration) -> Self {
        Lifecycle {
            registry,
            shutdown_timeout,
        }
    }

    /// Five steps (spec.md §4.5): wait for the external command queue to
    /// drain, `closeAll()` (skipping daemon replicas), snapshot the
    /// survivors, then poll until either every started/stopping replica has
    /// settled into `stopped` or the timeout elapses, re-notifying
    /// stragglers each cycle so a replica blocked on its interval sleep
    /// wakes promptly rather than waiting out a long `interval`.
    pub async fn shutdown(&self) {
        let start = Instant::now();
        let deadline = start + self.shutdown_timeout;
        info!("scheduler shutdown starting");

        // Step 1: let any command already being applied from the
        // coordination port's inbound queue finish before we start closing
        // replicas out from under it. `EmptyPort` and any port with no
        // inbound queue report zero here, making this an immediate no-op.
        while self.registry.coordination().pending_commands() > 0 {
            if Instant::now() >= deadline {
                warn!(
                    pending = self.registry.coordination().pending_commands(),
                    "shutdown deadline reached before the external command queue drained"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        self.registry.close_all().await;

        let mut check_interval = tokio::time::interval(Duration::from_millis(100));

        loop {
            self.registry.sweep_once().await;

            let remaining = self.registry.non_daemon_started_and_stopping_count();
            if remaining == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    remaining,
                    "scheduler shutdown deadline reached with tasks still in flight"
                );
                break;
            }

            for slot in self.registry.non_daemon_running_snapshot() {
                slot.notify_waiter();
            }
            check_interval.tick().await;
        }

        info!(elapsed_ms = start.elapsed().as_millis() as u64, "scheduler shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GroupName, TaskConfig, TaskId};
    use crate::coordination::empty::EmptyPort;
    use crate::schedule::testing::ImmediateSchedule;
    use crate::task::{TaskContext, TaskHooks};
    use async_trait::async_trait;

    struct QuickTask;

    #[async_trait]
    impl TaskHooks for QuickTask {
        async fn execute(&self, _ctx: &TaskContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct SlowIntervalTask;

    #[async_trait]
    impl TaskHooks for SlowIntervalTask {
        async fn execute(&self, _ctx: &TaskContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    /// `execute()` that outlasts any shutdown deadline used in these tests,
    /// standing in for a task caught mid-iteration when `close` is requested
    /// — closing is cooperative, never a forced cancellation.
    struct SlowExecuteTask;

    #[async_trait]
    impl TaskHooks for SlowExecuteTask {
        async fn execute(&self, _ctx: &TaskContext) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn shutdown_drains_a_running_task_within_timeout() {
        let registry = Arc::new(Registry::new(Arc::new(EmptyPort)));
        let group = GroupName::from("shut");
        let config = TaskConfig::new(
            TaskId::from("shut-0"),
            group,
            None,
            Duration::from_secs(3600),
            0,
            false,
            false,
            false,
        );
        registry.register(config, Arc::new(SlowIntervalTask)).unwrap();
        registry.start(&TaskId::from("shut-0")).await.unwrap();

        let lifecycle = Lifecycle::new(registry.clone(), Duration::from_secs(5));
        tokio::time::timeout(Duration::from_secs(2), lifecycle.shutdown())
            .await
            .expect("shutdown should complete well before its own timeout");

        assert_eq!(registry.started_and_stopping_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_gives_up_at_the_deadline_if_a_task_never_settles() {
        // close() only takes effect between iterations; a task stuck inside
        // a single long execute() cannot be force-cancelled, so the deadline
        // is what ends the wait, not the task settling.
        let registry = Arc::new(Registry::new(Arc::new(EmptyPort)));
        let group = GroupName::from("stuck");
        let config = TaskConfig::new(
            TaskId::from("stuck-0"),
            group,
            None,
            Duration::ZERO,
            1,
            false,
            false,
            false,
        );
        registry.register(config, Arc::new(SlowExecuteTask)).unwrap();
        registry.start(&TaskId::from("stuck-0")).await.unwrap();

        let lifecycle = Lifecycle::new(registry.clone(), Duration::from_millis(200));
        tokio::time::timeout(Duration::from_secs(2), lifecycle.shutdown())
            .await
            .expect("shutdown should return once its own deadline passes");
        assert_eq!(registry.started_and_stopping_count(), 1);
    }

    #[tokio::test]
    async fn shutdown_does_not_wait_on_a_daemon_replica() {
        let registry = Arc::new(Registry::new(Arc::new(EmptyPort)));
        let group = GroupName::from("daemon-group");
        let config = TaskConfig::new(
            TaskId::from("daemon-0"),
            group,
            None,
            Duration::from_secs(3600),
            0,
            true, // daemon
            false,
            false,
        );
        registry.register(config, Arc::new(SlowIntervalTask)).unwrap();
        registry.start(&TaskId::from("daemon-0")).await.unwrap();

        let lifecycle = Lifecycle::new(registry.clone(), Duration::from_secs(5));
        tokio::time::timeout(Duration::from_millis(500), lifecycle.shutdown())
            .await
            .expect("shutdown should not wait on a daemon replica");

        // close_all skips daemon replicas, so the task is still started.
        assert_eq!(registry.started_and_stopping_count(), 1);
    }
}
