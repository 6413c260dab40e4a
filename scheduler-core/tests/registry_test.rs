use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scheduler_core::coordination::empty::EmptyPort;
use scheduler_core::schedule::testing::ImmediateSchedule;
use scheduler_core::{GroupName, Registry, TaskConfig, TaskContext, TaskHooks, TaskId, TaskState};

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

fn registry() -> Arc<Registry> {
    Arc::new(Registry::new(Arc::new(EmptyPort)))
}

fn single_shot_config(id: &str, group: &str) -> TaskConfig {
    TaskConfig::new(
        TaskId::from(id),
        GroupName::from(group),
        Some(Arc::new(ImmediateSchedule)),
        Duration::ZERO,
        1,
        false,
        false,
        false,
    )
}

#[tokio::test]
async fn register_then_start_runs_the_task_to_its_run_limit() {
    let registry = registry();
    let calls = Arc::new(AtomicU64::new(0));
    registry
        .register(
            single_shot_config("probe-0", "probe"),
            Arc::new(CountingTask { calls: calls.clone() }),
        )
        .unwrap();

    let id = TaskId::from("probe-0");
    registry.start(&id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(registry.find(&id).unwrap().is_closed());
}

#[tokio::test]
async fn close_then_restart_runs_the_task_again() {
    let registry = registry();
    let calls = Arc::new(AtomicU64::new(0));
    let config = TaskConfig::new(
        TaskId::from("restart-0"),
        GroupName::from("restart"),
        None,
        Duration::from_secs(3600),
        0,
        false,
        false,
        false,
    );
    registry
        .register(config, Arc::new(CountingTask { calls: calls.clone() }))
        .unwrap();

    let id = TaskId::from("restart-0");
    registry.start(&id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    registry.close(&id).await.unwrap();

    // wait for the loop to actually exit and flip `closed`
    for _ in 0..50 {
        if registry.find(&id).unwrap().is_closed() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(registry.find(&id).unwrap().is_closed());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    registry.start(&id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    registry.close(&id).await.unwrap();
}

#[tokio::test]
async fn coordination_disabled_never_blocks_lifecycle_transitions() {
    let registry = registry();
    registry
        .register(single_shot_config("quiet-0", "quiet"), Arc::new(CountingTask {
            calls: Arc::new(AtomicU64::new(0)),
        }))
        .unwrap();
    let id = TaskId::from("quiet-0");

    assert!(!registry.is_coordination_enabled());
    registry.start(&id).await.unwrap();
    assert_eq!(registry.find(&id).unwrap().state(), TaskState::Started);
}

#[tokio::test]
async fn removing_a_running_replica_drains_through_stopping_before_it_vanishes() {
    let registry = registry();
    let group = GroupName::from("drain");
    for i in 0..2 {
        let config = TaskConfig::new(
            TaskId::from(format!("drain-{i}")),
            group.clone(),
            None,
            Duration::from_secs(3600),
            0,
            false,
            false,
            false,
        );
        registry
            .register(config, Arc::new(CountingTask { calls: Arc::new(AtomicU64::new(0)) }))
            .unwrap();
    }
    let _monitor = registry.spawn_status_monitor();
    let victim = TaskId::from("drain-1");
    registry.start(&victim).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(registry.find(&victim).unwrap().state(), TaskState::Started);

    // remove_replica on a running task issues close() and waits on the loop
    // to settle before it is actually dropped from the registry.
    let remaining = registry.remove_replica(&victim, false).await.unwrap();
    assert_eq!(remaining, 1);

    // the loop hasn't necessarily exited yet; the slot is either still
    // present (stopping) or already gone once its run_loop finishes.
    for _ in 0..30 {
        if registry.find(&victim).is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(registry.find(&victim).is_none(), "removed replica should eventually disappear from the registry");
    assert_eq!(registry.group_size(&group), 1);
}
