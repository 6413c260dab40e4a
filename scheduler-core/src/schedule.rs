//! `Schedule` is the opaque cron-like predicate spec.md treats as a
//! collaborator interface: "cron-expression parsing (treated as an opaque
//! `Schedule` type supplying `nextFireTime`)". This module supplies the one
//! concrete implementation the full crate needs (`CronSchedule`, backed by
//! the `cron` crate) plus a deterministic test double.

use std::fmt;
use std::time::SystemTime;

use chrono::{DateTime, Utc};

use crate::error::{Result, SchedulerError};

/// `nextAfter(now) -> instant`, per spec.md §2.
pub trait Schedule: Send + Sync + fmt::Debug {
    fn next_after(&self, now: SystemTime) -> Option<SystemTime>;
}

/// A cron expression, parsed once at registration time and evaluated against
/// UTC wall-clock time on every tick.
pub struct CronSchedule {
    expr: String,
    inner: cron::Schedule,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self> {
        let inner = expr
            .parse::<cron::Schedule>()
            .map_err(|e| SchedulerError::Config(format!("invalid cron expression '{expr}': {e}")))?;
        Ok(CronSchedule {
            expr: expr.to_string(),
            inner,
        })
    }
}

impl fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronSchedule").field(&self.expr).finish()
    }
}

impl Schedule for CronSchedule {
    fn next_after(&self, now: SystemTime) -> Option<SystemTime> {
        let now: DateTime<Utc> = now.into();
        self.inner.after(&now).next().map(Into::into)
    }
}

/// Fixed, non-wall-clock-dependent `Schedule` implementations used by this
/// crate's own test suite (unit tests in this module and the integration
/// tests under `tests/`). Not gated behind `#[cfg(test)]` so that
/// `tests/*.rs`, which are compiled as a separate crate, can reach it too.
pub mod testing {
    use super::*;
    use std::time::Duration;

    /// A `Schedule` that always fires immediately. Used by tests that need
    /// a deterministic, non-wall-clock-dependent driver for the scheduler
    /// loop; pair it with a `run_limit` to bound iterations.
    #[derive(Debug, Default)]
    pub struct ImmediateSchedule;

    impl Schedule for ImmediateSchedule {
        fn next_after(&self, now: SystemTime) -> Option<SystemTime> {
            Some(now)
        }
    }

    /// A `Schedule` that always fires `delay` in the future relative to `now`.
    #[derive(Debug)]
    pub struct FixedDelaySchedule {
        pub delay: Duration,
    }

    impl Schedule for FixedDelaySchedule {
        fn next_after(&self, now: SystemTime) -> Option<SystemTime> {
            Some(now + self.delay)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cron_schedule_rejects_malformed_expression() {
        assert!(CronSchedule::parse("not a cron expression").is_err());
    }

    #[test]
    fn cron_schedule_accepts_every_second() {
        let schedule = CronSchedule::parse("* * * * * *").unwrap();
        let next = schedule.next_after(SystemTime::now());
        assert!(next.is_some());
    }
}
