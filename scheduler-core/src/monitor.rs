//! `StatusMonitor`: the 1Hz sweep that finalises `stopping -> stopped`
//! transitions (spec.md §4.3). A loop body only sets `closed=true` on exit;
//! the sweep is what notices that and actually moves the replica into the
//! logical `stopped`/removed state and tells the coordination mirror.
//!
//! Grounded on the teacher's `TaskScheduler::stop()` deadline-poll idiom in
//! `agent/src/scheduler.rs`, generalised here into a standing periodic task
//! rather than a one-shot shutdown wait (that one-shot case is `Lifecycle`).

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::registry::Registry;

const SWEEP_PERIOD: Duration = Duration::from_secs(1);

impl Registry {
    /// Spawns the standing sweep. The returned handle may be dropped or
    /// aborted; there is no graceful stop for the sweep itself, since it
    /// does nothing but finalise state already settled by running loops.
    pub fn spawn_status_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_PERIOD);
            loop {
                interval.tick().await;
                registry.sweep_once().await;
            }
        })
    }

    /// One sweep pass: snapshot every `stopping` replica whose loop body has
    /// already set `closed=true`, then finalise each. The `closed` flag is
    /// the only signal consulted here — a `stopping` replica still running
    /// its `execute()` is left alone until the next tick.
    /// Also called directly by `Lifecycle::shutdown`'s poll loop so a
    /// draining replica is reaped as soon as its loop exits rather than
    /// waiting for the next standing sweep tick.
    pub(crate) async fn sweep_once(&self) {
        let staged: Vec<_> = self
            .stopping_slots()
            .into_iter()
            .filter(|slot| slot.is_closed())
            .collect();

        for slot in staged {
            debug!(task = %slot.id(), "status monitor finalising stopped task");
            self.finalize_stopped(&slot).await;
        }
    }
}
