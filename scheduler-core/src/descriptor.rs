//! The registration contract of spec.md §6 — input from the DI/scan
//! collaborator this crate does not implement (component discovery,
//! property loading, and package scanning are explicitly out of scope per
//! spec.md §1). Callers build one `TaskClassDescriptor` per task class and
//! hand it to `Registry::register_class`.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, SchedulerError};
use crate::schedule::{CronSchedule, Schedule};

/// One task class as the scan/DI layer would describe it, before the
/// `parallel`/`cron` resolution rules of spec.md §6 are applied.
#[derive(Debug, Clone)]
pub struct TaskClassDescriptor {
    pub name: String,
    /// Static `parallel` value from the class itself.
    pub static_parallel: usize,
    /// If true, `parallel` resolves to the host CPU count regardless of
    /// `static_parallel`/`parallel_property`.
    pub core_parallel: bool,
    /// Value read from a scanned property file, if any.
    pub parallel_property: Option<i64>,
    /// Last non-blank cron value scanned from property files, if any.
    pub cron_property: Option<String>,
    /// Static cron expression from the class itself.
    pub cron: Option<String>,
    pub interval: Duration,
    /// `runNumberOfTimes` — validated `>= 0` below (see SPEC_FULL.md §3).
    pub run_number_of_times: i64,
    pub before_after_only: bool,
    pub daemon: bool,
    pub lazy: bool,
    /// Classes scanned but not meant to run (feature-flagged off, etc.).
    pub defined: bool,
}

impl TaskClassDescriptor {
    /// Resolution order: `coreParallel ? CPU_COUNT : (propertyValue > 0 ?
    /// propertyValue : staticParallel)`, clamped to `>= 0`.
    pub fn resolve_parallel(&self) -> Result<usize> {
        if self.core_parallel {
            let cpus = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            return Ok(cpus);
        }

        if let Some(p) = self.parallel_property {
            if p > 0 {
                return Ok(p as usize);
            }
            if p < 0 {
                return Err(SchedulerError::Config(format!(
                    "task class '{}': parallelProperty must be >= 0, got {p}",
                    self.name
                )));
            }
        }

        Ok(self.static_parallel)
    }

    /// Resolution order: last non-blank value from scanned property files,
    /// else the static `cron`.
    pub fn resolve_cron(&self) -> Option<String> {
        self.cron_property
            .as_ref()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .or_else(|| self.cron.clone())
    }

    fn resolve_schedule(&self) -> Result<Option<Arc<dyn Schedule>>> {
        match self.resolve_cron() {
            Some(expr) => Ok(Some(Arc::new(CronSchedule::parse(&expr)?) as Arc<dyn Schedule>)),
            None => Ok(None),
        }
    }

    pub(crate) fn run_limit(&self) -> Result<u64> {
        if self.run_number_of_times < 0 {
            return Err(SchedulerError::Config(format!(
                "task class '{}': runNumberOfTimes must be >= 0, got {}",
                self.name, self.run_number_of_times
            )));
        }
        Ok(self.run_number_of_times as u64)
    }

    /// `parallel` replicas with consecutive indices, schedule/cron resolved
    /// once and shared across clones (`Arc<dyn Schedule>` is cheap to clone).
    pub(crate) fn resolved_schedule(&self) -> Result<Option<Arc<dyn Schedule>>> {
        self.resolve_schedule()
    }
}
