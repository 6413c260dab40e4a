//! Real `CoordinationPort` backed by etcd, grounded on the `ballista`
//! scheduler's `cluster/mod.rs` (the `other_examples/` file named
//! `...ballista-scheduler-src-cluster-mod.rs.rs` in the retrieval pack):
//! connect once via `etcd_client::Client::connect`, keep the
//! cheaply-`Clone`-able client around, and `put`/`get`/`watch` under a
//! namespace prefix.
//!
//! Three extra background tasks round out spec.md §4.4's "additional
//! background tasks run under the mirror when enabled": a TTL lease
//! refresher, a FIFO command watcher (replacing ballista's JMX-less
//! equivalent), and — per SPEC_FULL.md §4.4 — a structured-logging
//! `group_sizes` snapshot in place of a JMX bridge, since there is no JVM.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, EventType, GetOptions, PutOptions, SortOrder, SortTarget, WatchOptions,
};
use tracing::{debug, warn};

use super::{Command, CoordinationPort};
use crate::config::{GroupName, TaskId};
use crate::error::SchedulerError;
use crate::registry::Registry;
use crate::task::TaskAnalysis;

pub struct EtcdPort {
    client: Client,
    root: String,
    /// Commands read from `_commands/` but not yet applied and cleared;
    /// shared with `spawn_command_watcher` so `pending_commands()` reflects
    /// the watcher's real backlog (spec.md §4.5 step 1).
    pending: Arc<AtomicUsize>,
}

impl EtcdPort {
    pub async fn connect(endpoints: &[String], root: impl Into<String>) -> Result<Self, SchedulerError> {
        let client = Client::connect(endpoints, None)
            .await
            .map_err(|e| SchedulerError::Coordination(format!("failed to connect to etcd: {e}")))?;
        Ok(EtcdPort {
            client,
            root: root.into(),
            pending: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn state_key(&self, group: &GroupName, id: &TaskId) -> String {
        format!("{}/{}/{}/state", self.root, group, id)
    }

    fn analysis_key(&self, group: &GroupName, id: &TaskId) -> String {
        format!("{}/{}/{}/analysis", self.root, group, id)
    }

    async fn publish(&self, group: &GroupName, id: &TaskId, state: &str, analysis: &TaskAnalysis) {
        let mut client = self.client.clone();

        if let Err(e) = client.put(self.state_key(group, id), state, None).await {
            warn!(task = %id, error = %e, "failed to publish task state to etcd");
        }

        match serde_json::to_vec(analysis) {
            Ok(body) => {
                if let Err(e) = client.put(self.analysis_key(group, id), body, None).await {
                    warn!(task = %id, error = %e, "failed to publish task analysis to etcd");
                }
            }
            Err(e) => warn!(task = %id, error = %e, "failed to serialize task analysis"),
        }
    }

    /// TTL refresher keeping `self.root` alive (spec.md §4.4).
    pub async fn spawn_ttl_refresher(
        &self,
        ttl_secs: i64,
    ) -> anyhow::Result<tokio::task::JoinHandle<()>> {
        let mut client = self.client.clone();
        let lease = client.lease_grant(ttl_secs, None).await?;
        let lease_id = lease.id();
        client
            .put(
                self.root.clone(),
                "",
                Some(PutOptions::new().with_lease(lease_id)),
            )
            .await?;
        let (mut keeper, mut stream) = client.lease_keep_alive(lease_id).await?;
        let period = Duration::from_secs((ttl_secs / 2).max(1) as u64);

        Ok(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if keeper.keep_alive().await.is_err() {
                    warn!("etcd lease keep-alive send failed, refresher stopping");
                    break;
                }
                match stream.message().await {
                    Ok(Some(_)) => {}
                    _ => {
                        warn!("etcd lease keep-alive stream closed, refresher stopping");
                        break;
                    }
                }
            }
        }))
    }
}

#[async_trait]
impl CoordinationPort for EtcdPort {
    async fn publish_start(&self, group: &GroupName, id: &TaskId, analysis: &TaskAnalysis) {
        self.publish(group, id, "STARTED", analysis).await;
    }

    async fn publish_stopping(&self, group: &GroupName, id: &TaskId, analysis: &TaskAnalysis) {
        self.publish(group, id, "STOPPING", analysis).await;
    }

    async fn publish_stopped(
        &self,
        group: &GroupName,
        id: &TaskId,
        removed: bool,
        analysis: &TaskAnalysis,
    ) {
        let state = if removed { "REMOVED" } else { "STOPPED" };
        self.publish(group, id, state, analysis).await;
    }

    fn pending_commands(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

/// Spawns the inbound watch loop: drains any `_commands/<ordered-seq>`
/// entries already queued (in lexicographic/FIFO order), then watches for
/// new ones, dispatching each into `registry` and clearing the key once
/// applied. Takes `port` itself (rather than a bare client/root pair) so the
/// watcher shares `port.pending` with `CoordinationPort::pending_commands`,
/// which is what `Lifecycle::shutdown` polls in spec.md §4.5 step 1.
pub fn spawn_command_watcher(port: &EtcdPort, registry: Arc<Registry>) -> tokio::task::JoinHandle<()> {
    let client = port.client.clone();
    let root = port.root.clone();
    let pending = port.pending.clone();
    tokio::spawn(async move {
        let prefix = format!("{root}/_commands/");
        loop {
            if let Err(e) = run_watch_once(client.clone(), &prefix, &registry, &pending).await {
                warn!(error = %e, "etcd command watch failed, retrying in 2s");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    })
}

async fn run_watch_once(
    mut client: Client,
    prefix: &str,
    registry: &Arc<Registry>,
    pending: &Arc<AtomicUsize>,
) -> anyhow::Result<()> {
    let queued = client
        .get(
            prefix,
            Some(
                GetOptions::new()
                    .with_prefix()
                    .with_sort(SortTarget::Key, SortOrder::Ascend),
            ),
        )
        .await?;
    pending.fetch_add(queued.kvs().len(), Ordering::AcqRel);
    for kv in queued.kvs() {
        apply_and_clear(&mut client, registry, kv.key(), kv.value()).await;
        pending.fetch_sub(1, Ordering::AcqRel);
    }

    let (_watcher, mut stream) = client
        .watch(prefix.to_string(), Some(WatchOptions::new().with_prefix()))
        .await?;
    while let Some(resp) = stream.message().await? {
        for event in resp.events() {
            if event.event_type() == EventType::Put {
                if let Some(kv) = event.kv() {
                    pending.fetch_add(1, Ordering::AcqRel);
                    apply_and_clear(&mut client, registry, kv.key(), kv.value()).await;
                    pending.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }
    }
    Ok(())
}

async fn apply_and_clear(client: &mut Client, registry: &Arc<Registry>, key: &[u8], value: &[u8]) {
    let key = String::from_utf8_lossy(key).to_string();
    let value = String::from_utf8_lossy(value).to_string();

    match parse_command(&value) {
        Some(command) => dispatch(registry, command).await,
        None => warn!(%key, %value, "unrecognized scheduler command, ignoring"),
    }

    if let Err(e) = client.delete(key.clone(), None).await {
        warn!(%key, error = %e, "failed to clear consumed command");
    }
}

fn parse_command(value: &str) -> Option<Command> {
    let mut parts = value.split_whitespace();
    match parts.next()? {
        "start" => Some(Command::Start {
            group: GroupName::from(parts.next()?),
            id: TaskId::from(parts.next()?),
        }),
        "stop" => Some(Command::Stop {
            group: GroupName::from(parts.next()?),
            id: TaskId::from(parts.next()?),
        }),
        "append" => Some(Command::Append {
            group: GroupName::from(parts.next()?),
            n: parts.next()?.parse().ok()?,
        }),
        "remove" => Some(Command::Remove {
            group: GroupName::from(parts.next()?),
        }),
        _ => None,
    }
}

async fn dispatch(registry: &Arc<Registry>, command: Command) {
    debug!(?command, "applying remote scheduler command");
    let result = match command {
        Command::Start { id, .. } => registry.start(&id).await.map(|_| ()),
        Command::Stop { id, .. } => registry.close(&id).await,
        Command::Append { group, n } => registry.append(&group, n, true).await.map(|_| ()),
        Command::Remove { group } => registry.remove_replica_last(&group).await.map(|_| ()),
    };
    if let Err(e) = result {
        warn!(error = %e, "failed to apply remote scheduler command");
    }
}
