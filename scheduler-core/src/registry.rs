//! `Registry`: the factory. A single authoritative `DashMap<TaskId,
//! Arc<TaskSlot>>` plus a per-group ordered member list, per the "Move
//! between maps without global lock" design note in spec.md §9 — the three
//! logical tables (`started`/`stopping`/`stopped`) are derived by filtering
//! on `TaskSlot::state()` rather than kept as three separate maps.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use tracing::info;

use crate::config::{GroupName, TaskConfig, TaskId};
use crate::coordination::{empty::EmptyPort, CoordinationPort};
use crate::descriptor::TaskClassDescriptor;
use crate::error::{Result, SchedulerError};
use crate::task::{run_loop, TaskHooks, TaskSlot, TaskState};

pub struct Registry {
    slots: DashMap<TaskId, Arc<TaskSlot>>,
    groups: DashMap<GroupName, Vec<TaskId>>,
    clone_counters: DashMap<GroupName, AtomicU64>,
    coordination: Arc<dyn CoordinationPort>,
}

static GLOBAL: OnceLock<Arc<Registry>> = OnceLock::new();

impl Registry {
    pub fn new(coordination: Arc<dyn CoordinationPort>) -> Self {
        Registry {
            slots: DashMap::new(),
            groups: DashMap::new(),
            clone_counters: DashMap::new(),
            coordination,
        }
    }

    /// Lazily-initialised process-wide singleton, per §9's "the default
    /// construction still permits a lazy global for convenience". Prefer
    /// an explicit `Registry::new` + `Arc` wired through your application
    /// for anything that needs coordination enabled.
    pub fn global() -> Arc<Registry> {
        GLOBAL
            .get_or_init(|| Arc::new(Registry::new(Arc::new(EmptyPort))))
            .clone()
    }

    // ---- registration -----------------------------------------------

    /// `register(task)`. Fails with `AlreadyRegistered` if `id` exists in
    /// any registry. Inserts into `stopped` and appends to `group[task.group]`.
    pub fn register(&self, config: TaskConfig, hooks: Arc<dyn TaskHooks>) -> Result<()> {
        if self.slots.contains_key(&config.id) {
            return Err(SchedulerError::AlreadyRegistered(config.id));
        }

        let group = config.group.clone();
        let id = config.id.clone();
        let slot = TaskSlot::new(config, hooks);
        self.slots.insert(id.clone(), slot);
        self.groups.entry(group.clone()).or_default().push(id.clone());

        let group_len = self.groups.get(&group).map(|g| g.len()).unwrap_or(1) as u64;
        self.clone_counters
            .entry(group.clone())
            .and_modify(|counter| {
                counter.store(group_len, Ordering::SeqCst);
            })
            .or_insert_with(|| AtomicU64::new(group_len));

        self.rebalance(&group);
        info!(task = %id, group = %group, "task registered");
        Ok(())
    }

    /// Builds and registers `descriptor.resolve_parallel()` replicas with
    /// consecutive indices `0..parallel-1`, sharing one hooks implementation
    /// (hooks read their shard assignment from the `TaskContext` passed to
    /// every call, never from shared mutable state).
    pub fn register_class(
        &self,
        descriptor: &TaskClassDescriptor,
        hooks: Arc<dyn TaskHooks>,
    ) -> Result<Vec<TaskId>> {
        if !descriptor.defined {
            return Ok(Vec::new());
        }

        let parallel = descriptor.resolve_parallel()?;
        let schedule = descriptor.resolved_schedule()?;
        let run_limit = descriptor.run_limit()?;
        let group = GroupName::new(descriptor.name.as_str())?;

        let mut ids = Vec::with_capacity(parallel);
        for _ in 0..parallel {
            let id = TaskId::from(format!("{}-{}", descriptor.name, ids.len()));
            let config = TaskConfig::new(
                id.clone(),
                group.clone(),
                schedule.clone(),
                descriptor.interval,
                run_limit,
                descriptor.daemon,
                descriptor.lazy,
                descriptor.before_after_only,
            );
            self.register(config, hooks.clone())?;
            ids.push(id);
        }
        Ok(ids)
    }

    // ---- start / close ------------------------------------------------

    /// `start(id)`. No-op unless the task is currently `stopped` and closed.
    pub async fn start(&self, id: &TaskId) -> Result<()> {
        let slot = self.find(id).ok_or_else(|| SchedulerError::NotFound(id.clone()))?;
        if slot.state() != TaskState::Stopped || !slot.is_closed() {
            return Ok(());
        }

        slot.prepare_for_start();
        tokio::spawn(run_loop(slot.clone()));
        self.coordination
            .publish_start(slot.group(), id, &slot.analysis_snapshot())
            .await;
        info!(task = %id, "task started");
        Ok(())
    }

    pub async fn start_group(&self, group: &GroupName) -> Result<()> {
        for id in self.stopped_ids_in(group) {
            self.start(&id).await?;
        }
        Ok(())
    }

    pub async fn start_all(&self) -> Result<()> {
        let ids: Vec<TaskId> = self
            .slots
            .iter()
            .filter(|e| e.value().state() == TaskState::Stopped)
            .map(|e| e.key().clone())
            .collect();
        for id in ids {
            self.start(&id).await?;
        }
        Ok(())
    }

    /// `close(id)`. Idempotent: calling twice leaves the same end state.
    pub async fn close(&self, id: &TaskId) -> Result<()> {
        let slot = self.find(id).ok_or_else(|| SchedulerError::NotFound(id.clone()))?;
        self.close_slot(&slot).await;
        Ok(())
    }

    async fn close_slot(&self, slot: &Arc<TaskSlot>) {
        let was_started = slot.state() == TaskState::Started;
        slot.request_close();
        if was_started {
            slot.set_state(TaskState::Stopping);
            self.coordination
                .publish_stopping(slot.group(), slot.id(), &slot.analysis_snapshot())
                .await;
            info!(task = %slot.id(), "task closing");
        }
    }

    /// Skips daemon-flagged replicas (spec.md §4.2): a bulk close never
    /// touches them, only an explicit `close(id)` does.
    pub async fn close_group(&self, group: &GroupName) -> Result<()> {
        for slot in self.slots_in(group) {
            if !slot.is_daemon() {
                self.close_slot(&slot).await;
            }
        }
        Ok(())
    }

    /// Skips daemon-flagged replicas, same rule as `close_group`.
    pub async fn close_all(&self) {
        let slots: Vec<Arc<TaskSlot>> = self.slots.iter().map(|e| e.value().clone()).collect();
        for slot in slots {
            if !slot.is_daemon() {
                self.close_slot(&slot).await;
            }
        }
    }

    // ---- group membership ----------------------------------------------

    /// Clones the last replica in `group` `size` times; new replicas start
    /// in `stopped`, `closed=true`.
    pub async fn append(
        &self,
        group: &GroupName,
        size: usize,
        auto_start: bool,
    ) -> Result<Vec<TaskId>> {
        let template = self
            .find_last(group)
            .ok_or_else(|| SchedulerError::GroupNotFound(group.clone()))?;

        let mut new_ids = Vec::with_capacity(size);
        for _ in 0..size {
            let n = self
                .clone_counters
                .entry(group.clone())
                .or_insert_with(|| AtomicU64::new(0))
                .fetch_add(1, Ordering::SeqCst);
            let id = TaskId::from(format!("{group}-{n}"));
            if self.slots.contains_key(&id) {
                return Err(SchedulerError::AlreadyRegistered(id));
            }

            let config = template.config.cloned_for(id.clone());
            let slot = TaskSlot::new(config, template_hooks(&template));
            self.slots.insert(id.clone(), slot);
            self.groups.entry(group.clone()).or_default().push(id.clone());
            new_ids.push(id);
        }

        self.rebalance(group);

        if auto_start {
            for id in &new_ids {
                self.start(id).await?;
            }
        } else {
            for id in &new_ids {
                if let Some(slot) = self.find(id) {
                    self.coordination
                        .publish_stopped(group, id, false, &slot.analysis_snapshot())
                        .await;
                }
            }
        }

        info!(group = %group, added = new_ids.len(), "group appended");
        Ok(new_ids)
    }

    /// Removes one replica. Does nothing (returns the current size) if the
    /// group has only one replica and `force` is false.
    pub async fn remove_replica(&self, id: &TaskId, force: bool) -> Result<usize> {
        let slot = self.find(id).ok_or_else(|| SchedulerError::NotFound(id.clone()))?;
        let group = slot.group().clone();
        let size = self.group_size(&group);

        if size <= 1 && !force {
            return Ok(size);
        }

        self.detach_from_group(&group, id);
        slot.mark_for_removal();

        if !slot.is_closed() {
            self.close_slot(&slot).await;
        } else {
            self.slots.remove(id);
            self.coordination
                .publish_stopped(&group, id, true, &slot.analysis_snapshot())
                .await;
        }

        self.rebalance(&group);
        Ok(self.group_size(&group))
    }

    /// Removes the last (highest-index) replica of `group`.
    pub async fn remove_replica_last(&self, group: &GroupName) -> Result<usize> {
        let id = self
            .find_last(group)
            .map(|slot| slot.id().clone())
            .ok_or_else(|| SchedulerError::GroupNotFound(group.clone()))?;
        self.remove_replica(&id, false).await
    }

    /// Repeatedly removes the last replica until one remains, then closes it.
    pub async fn remove_group(&self, group: &GroupName) -> Result<()> {
        while self.group_size(group) > 1 {
            self.remove_replica_last(group).await?;
        }
        self.close_group(group).await?;
        Ok(())
    }

    fn detach_from_group(&self, group: &GroupName, id: &TaskId) {
        if let Some(mut members) = self.groups.get_mut(group) {
            members.retain(|member| member != id);
        }
    }

    /// Recomputes `(index, total)` on every replica of `group` so indices
    /// are contiguous `0..len-1` and `total == len`, in insertion order.
    fn rebalance(&self, group: &GroupName) {
        let Some(members) = self.groups.get(group) else {
            return;
        };
        let total = members.len();
        for (index, id) in members.iter().enumerate() {
            if let Some(slot) = self.slots.get(id) {
                slot.set_index_total(index, total);
            }
        }
    }

    // ---- queries ---------------------------------------------------------

    pub fn find(&self, id: &TaskId) -> Option<Arc<TaskSlot>> {
        self.slots.get(id).map(|entry| entry.value().clone())
    }

    /// The highest-`index` replica currently in `group`.
    pub fn find_last(&self, group: &GroupName) -> Option<Arc<TaskSlot>> {
        let members = self.groups.get(group)?;
        let id = members.last()?;
        self.find(id)
    }

    pub fn group_size(&self, group: &GroupName) -> usize {
        self.groups.get(group).map(|m| m.len()).unwrap_or(0)
    }

    pub fn has_started_group(&self, group: &GroupName) -> bool {
        self.slots_in(group)
            .iter()
            .any(|slot| slot.state() == TaskState::Started)
    }

    pub fn has_stopped_group(&self, group: &GroupName) -> bool {
        self.slots_in(group)
            .iter()
            .any(|slot| slot.state() == TaskState::Stopped)
    }

    /// Per-group replica counts, the structured-logging stand-in for the
    /// "optional JMX bridge" of spec.md §4.4 (see SPEC_FULL.md).
    pub fn group_sizes(&self) -> Vec<(GroupName, usize)> {
        self.groups
            .iter()
            .map(|e| (e.key().clone(), e.value().len()))
            .collect()
    }

    pub(crate) fn slots_in(&self, group: &GroupName) -> Vec<Arc<TaskSlot>> {
        self.groups
            .get(group)
            .map(|members| members.iter().filter_map(|id| self.find(id)).collect())
            .unwrap_or_default()
    }

    fn stopped_ids_in(&self, group: &GroupName) -> Vec<TaskId> {
        self.slots_in(group)
            .into_iter()
            .filter(|slot| slot.state() == TaskState::Stopped)
            .map(|slot| slot.id().clone())
            .collect()
    }

    /// Snapshot of every replica currently `started` or `stopping` (used by
    /// `Lifecycle` and `StatusMonitor`).
    pub(crate) fn running_snapshot(&self) -> Vec<Arc<TaskSlot>> {
        self.slots
            .iter()
            .map(|e| e.value().clone())
            .filter(|slot| matches!(slot.state(), TaskState::Started | TaskState::Stopping))
            .collect()
    }

    pub fn started_and_stopping_count(&self) -> usize {
        self.running_snapshot().len()
    }

    /// Same as `running_snapshot` but with daemon-flagged replicas filtered
    /// out. `Lifecycle::shutdown` drains against this, not the plain
    /// snapshot, so daemon tasks never hold up process exit (spec.md §4.2).
    pub(crate) fn non_daemon_running_snapshot(&self) -> Vec<Arc<TaskSlot>> {
        self.running_snapshot().into_iter().filter(|slot| !slot.is_daemon()).collect()
    }

    pub(crate) fn non_daemon_started_and_stopping_count(&self) -> usize {
        self.non_daemon_running_snapshot().len()
    }

    /// Replicas currently tagged `stopping`, for `StatusMonitor`'s sweep.
    pub(crate) fn stopping_slots(&self) -> Vec<Arc<TaskSlot>> {
        self.slots
            .iter()
            .map(|e| e.value().clone())
            .filter(|slot| slot.state() == TaskState::Stopping)
            .collect()
    }

    /// Atomically finalises a `stopping -> stopped` (or removal) transition
    /// for one slot, guarding against a racing re-registration with the
    /// same id by checking pointer identity first (spec.md §4.3).
    pub(crate) async fn finalize_stopped(&self, slot: &Arc<TaskSlot>) {
        let id = slot.id().clone();
        let still_current = self
            .slots
            .get(&id)
            .is_some_and(|entry| Arc::ptr_eq(entry.value(), slot));
        if !still_current {
            return;
        }

        let removed = slot.is_marked_for_removal();
        if removed {
            self.slots.remove(&id);
        } else {
            slot.set_state(TaskState::Stopped);
        }

        self.coordination
            .publish_stopped(slot.group(), &id, removed, &slot.analysis_snapshot())
            .await;
        info!(task = %id, removed, "task stopped");
    }

    pub(crate) fn coordination(&self) -> &Arc<dyn CoordinationPort> {
        &self.coordination
    }

    pub fn is_coordination_enabled(&self) -> bool {
        self.coordination.is_enabled()
    }
}

fn template_hooks(template: &Arc<TaskSlot>) -> Arc<dyn TaskHooks> {
    template.hooks_handle()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::empty::EmptyPort;
    use crate::schedule::testing::ImmediateSchedule;
    use async_trait::async_trait;
    use std::time::Duration;

    struct NoopTask;

    #[async_trait]
    impl TaskHooks for NoopTask {
        async fn execute(&self, _ctx: &crate::task::TaskContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn registry() -> Registry {
        Registry::new(Arc::new(EmptyPort))
    }

    fn config(group: &GroupName, index: usize) -> TaskConfig {
        TaskConfig::new(
            TaskId::from(format!("{group}-{index}")),
            group.clone(),
            Some(Arc::new(ImmediateSchedule)),
            Duration::ZERO,
            1,
            false,
            false,
            false,
        )
    }

    #[tokio::test]
    async fn register_and_start_then_rebalance_on_append() {
        let registry = registry();
        let group = GroupName::from("x");
        for i in 0..3 {
            registry.register(config(&group, i), Arc::new(NoopTask)).unwrap();
        }
        assert_eq!(registry.group_size(&group), 3);
        for (i, slot) in registry.slots_in(&group).iter().enumerate() {
            assert_eq!(slot.index(), i);
            assert_eq!(slot.total(), 3);
        }

        registry.append(&group, 2, false).await.unwrap();
        assert_eq!(registry.group_size(&group), 5);
        let ids: Vec<String> = registry
            .slots_in(&group)
            .iter()
            .map(|s| s.id().to_string())
            .collect();
        assert!(ids.contains(&"x-3".to_string()));
        assert!(ids.contains(&"x-4".to_string()));
        for slot in registry.slots_in(&group) {
            assert_eq!(slot.total(), 5);
            assert_eq!(slot.state(), TaskState::Stopped);
        }
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let registry = registry();
        let group = GroupName::from("y");
        registry.register(config(&group, 0), Arc::new(NoopTask)).unwrap();
        let err = registry.register(config(&group, 0), Arc::new(NoopTask)).unwrap_err();
        assert!(matches!(err, SchedulerError::AlreadyRegistered(_)));
    }

    #[tokio::test]
    async fn remove_replica_on_singleton_group_is_a_noop_without_force() {
        let registry = registry();
        let group = GroupName::from("z");
        registry.register(config(&group, 0), Arc::new(NoopTask)).unwrap();
        let id = TaskId::from("z-0");

        let remaining = registry.remove_replica(&id, false).await.unwrap();
        assert_eq!(remaining, 1);
        assert!(registry.find(&id).is_some());

        let remaining = registry.remove_replica(&id, true).await.unwrap();
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn start_on_already_started_task_is_a_noop() {
        let registry = registry();
        let group = GroupName::from("w");
        registry
            .register(
                TaskConfig::new(
                    TaskId::from("w-0"),
                    group.clone(),
                    None,
                    Duration::from_secs(3600),
                    0,
                    false,
                    false,
                    false,
                ),
                Arc::new(NoopTask),
            )
            .unwrap();
        let id = TaskId::from("w-0");

        registry.start(&id).await.unwrap();
        assert_eq!(registry.find(&id).unwrap().state(), TaskState::Started);
        registry.start(&id).await.unwrap();
        assert_eq!(registry.find(&id).unwrap().state(), TaskState::Started);

        registry.close(&id).await.unwrap();
    }
}
