//! Task identifiers and the immutable descriptor for one scheduled replica.
//!
//! `index`/`total` are deliberately *not* part of this struct — they are
//! the two fields `Registry::rebalance` recomputes on every group membership
//! change, and they live on the runtime `TaskSlot` (see `task.rs`) as plain
//! atomics so a running replica can cheaply re-read its shard assignment at
//! the start of every loop iteration without taking a lock on the rest of
//! its configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, SchedulerError};
use crate::schedule::Schedule;

/// Unique identifier for one task replica, by convention `"{group}-{index}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(Arc<str>);

impl TaskId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        TaskId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        TaskId(s.into())
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        TaskId(Arc::from(s))
    }
}

/// Name of a replica group. Groups are compared and hashed by value, not identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupName(Arc<str>);

impl GroupName {
    pub fn new(name: impl Into<Arc<str>>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(SchedulerError::Config("group name must not be empty".into()));
        }
        Ok(GroupName(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GroupName {
    fn from(s: &str) -> Self {
        GroupName(Arc::from(s))
    }
}

/// Immutable-ish descriptor for one replica (everything but shard assignment).
#[derive(Clone)]
pub struct TaskConfig {
    pub id: TaskId,
    pub group: GroupName,
    /// Opaque cron-like predicate. `None` means the task runs continuously,
    /// bounded by `interval` between iterations.
    pub schedule: Option<Arc<dyn Schedule>>,
    /// Minimum sleep between iterations when `schedule` is absent.
    pub interval: Duration,
    /// 0 = unbounded; otherwise stop after this many successful executions.
    pub run_limit: u64,
    pub daemon: bool,
    pub lazy: bool,
    pub before_after_only: bool,
}

impl fmt::Debug for TaskConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskConfig")
            .field("id", &self.id)
            .field("group", &self.group)
            .field("has_schedule", &self.schedule.is_some())
            .field("interval", &self.interval)
            .field("run_limit", &self.run_limit)
            .field("daemon", &self.daemon)
            .field("lazy", &self.lazy)
            .field("before_after_only", &self.before_after_only)
            .finish()
    }
}

impl TaskConfig {
    /// Builds a config for one replica, validating the invariants spec.md
    /// places on `TaskConfig` (negative run counts are a config error, not a
    /// silent "unbounded" per the Open Question in SPEC_FULL.md §3).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: TaskId,
        group: GroupName,
        schedule: Option<Arc<dyn Schedule>>,
        interval: Duration,
        run_limit: u64,
        daemon: bool,
        lazy: bool,
        before_after_only: bool,
    ) -> Self {
        TaskConfig {
            id,
            group,
            schedule,
            interval,
            run_limit,
            daemon,
            lazy,
            before_after_only,
        }
    }

    /// Clones this config onto a new id, for use when `Registry::append`
    /// stamps out new replicas from the group's last member.
    pub(crate) fn cloned_for(&self, id: TaskId) -> Self {
        TaskConfig {
            id,
            group: self.group.clone(),
            schedule: self.schedule.clone(),
            interval: self.interval,
            run_limit: self.run_limit,
            daemon: self.daemon,
            lazy: self.lazy,
            before_after_only: self.before_after_only,
        }
    }
}
