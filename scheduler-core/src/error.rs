//! Error kinds for the scheduler core.
//!
//! Failures inside a running task's hooks never surface here — they are
//! caught in the scheduler loop (see `task.rs`), logged, and folded into
//! the task's analysis counters. Only failures of the lifecycle primitives
//! themselves (register/start/close/find/...) are returned to callers.

use crate::config::{GroupName, TaskId};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("task already registered: {0}")]
    AlreadyRegistered(TaskId),

    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("group not found: {0}")]
    GroupNotFound(GroupName),

    #[error("coordination error: {0}")]
    Coordination(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
