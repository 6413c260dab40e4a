//! `CoordinationMirror`: the facade spec.md §4.4 asks for — three outbound
//! publish methods the `Registry` calls on every lifecycle transition, plus
//! an inbound command channel external peers use to drive the registry.
//!
//! `Registry` depends only on `CoordinationPort`, never on a concrete
//! backend, so it "must never branch on whether coordination is present"
//! (spec.md §4.4's closing requirement) — disabled coordination is simply
//! the `empty::EmptyPort` behind the same trait object.

pub mod empty;
#[cfg(feature = "etcd")]
pub mod etcd;

use async_trait::async_trait;

use crate::config::{GroupName, TaskId};
use crate::task::TaskAnalysis;

/// A control command received from a remote peer (spec.md §4.4 and the key
/// layout in §6: `/<root>/_commands/<ordered-seq>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start { group: GroupName, id: TaskId },
    Stop { group: GroupName, id: TaskId },
    Append { group: GroupName, n: usize },
    Remove { group: GroupName },
}

/// Outbound half of the mirror. Implementations must not block local
/// scheduling on coordination availability (spec.md §7: "Coordination
/// unavailability must never block local scheduling") — failures are
/// logged and retried internally, never returned to the `Registry` caller.
#[async_trait]
pub trait CoordinationPort: Send + Sync {
    async fn publish_start(&self, group: &GroupName, id: &TaskId, analysis: &TaskAnalysis);

    async fn publish_stopping(&self, group: &GroupName, id: &TaskId, analysis: &TaskAnalysis);

    async fn publish_stopped(
        &self,
        group: &GroupName,
        id: &TaskId,
        removed: bool,
        analysis: &TaskAnalysis,
    );

    /// Whether this port actually talks to a backend. `Registry` uses this
    /// only for a one-line startup log, never to change behaviour.
    fn is_enabled(&self) -> bool {
        true
    }

    /// External commands received but not yet applied to the `Registry`
    /// (spec.md §4.5 step 1: "wait for any external work queue to drain").
    /// Ports with no inbound command queue — including `EmptyPort` — report
    /// zero, so `Lifecycle::shutdown`'s drain-wait is an immediate no-op for
    /// them.
    fn pending_commands(&self) -> usize {
        0
    }
}
