//! The `EMPTY` implementation used when `scheduler.etcd.enable=false`
//! (spec.md §4.4). All publications are dropped; there is nothing to watch.

use async_trait::async_trait;

use super::CoordinationPort;
use crate::config::{GroupName, TaskId};
use crate::task::TaskAnalysis;

#[derive(Debug, Default)]
pub struct EmptyPort;

#[async_trait]
impl CoordinationPort for EmptyPort {
    async fn publish_start(&self, _group: &GroupName, _id: &TaskId, _analysis: &TaskAnalysis) {}

    async fn publish_stopping(&self, _group: &GroupName, _id: &TaskId, _analysis: &TaskAnalysis) {}

    async fn publish_stopped(
        &self,
        _group: &GroupName,
        _id: &TaskId,
        _removed: bool,
        _analysis: &TaskAnalysis,
    ) {
    }

    fn is_enabled(&self) -> bool {
        false
    }
}
