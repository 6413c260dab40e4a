//! Process-local, cluster-aware registry and lifecycle manager for
//! cron-driven worker tasks.
//!
//! A [`Registry`](registry::Registry) holds one [`TaskSlot`](task::TaskSlot)
//! per replica, driven by a [`Schedule`](schedule::Schedule). Replicas are
//! organised into groups that can be grown or shrunk at runtime via
//! `append`/`remove_replica`, with an optional [`CoordinationPort`] mirroring
//! every transition to a cluster-wide store so peers can observe and drive
//! this process's scheduler remotely.

pub mod config;
pub mod coordination;
pub mod descriptor;
pub mod error;
pub mod lifecycle;
pub mod monitor;
pub mod registry;
pub mod schedule;
pub mod settings;
pub mod task;

pub use config::{GroupName, TaskConfig, TaskId};
pub use coordination::CoordinationPort;
pub use descriptor::TaskClassDescriptor;
pub use error::{Result, SchedulerError};
pub use lifecycle::Lifecycle;
pub use registry::Registry;
pub use schedule::{CronSchedule, Schedule};
pub use settings::SchedulerSettings;
pub use task::{TaskAnalysis, TaskContext, TaskHooks, TaskState};
