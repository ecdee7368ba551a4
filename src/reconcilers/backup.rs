//! CassandraBackup reconciler
//!
//! A backup run resolves the datacenter's nodes, records them as in progress,
//! asks every node's agent to take the backup concurrently and then flushes
//! the per-node outcomes in one status write. Deleting a backup removes it
//! from remote storage in the background before the finalizer is released.

use std::sync::{Arc, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::{AgentClientFactory, Node, Precondition};
use crate::config::OperatorConfig;
use crate::controllers::Context;
use crate::crd::{
    BackupType, CassandraBackup, CassandraBackupStatus, CassandraDatacenter, DatacenterSnapshot,
};
use crate::error::{Error, Result};
use crate::metrics;
use crate::retry::{retry_with_backoff, RetryConfig};

/// Finalizer holding a deleted backup until remote storage is cleaned up
pub const BACKUP_FINALIZER: &str = "cassandra.k8ssandra.io/backup-finalizer";

/// Requeue while a run is in flight elsewhere
pub const RUN_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Requeue while a background deletion is running
pub const DELETION_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Reconcile one CassandraBackup
#[instrument(skip(ctx))]
pub async fn reconcile(namespace: &str, name: &str, ctx: Arc<Context>) -> Result<Action> {
    let Some(backup) = ctx.cluster.get_backup(namespace, name).await? else {
        debug!("CassandraBackup no longer exists");
        return Ok(Action::await_change());
    };

    if backup.metadata.deletion_timestamp.is_some() {
        return handle_deletion(backup, ctx).await;
    }

    let backup = ensure_finalizer(backup, &ctx).await?;
    let status = backup.status.clone().unwrap_or_default();

    if status.finish_time.is_some() {
        return Ok(Action::await_change());
    }

    if let Some(start_time) = status.start_time {
        if status.in_progress.is_empty() {
            complete_run(&backup, status, &ctx).await?;
            return Ok(Action::await_change());
        }
        if run_is_stale(start_time, &ctx.config) {
            recover_stranded_run(&backup, status, &ctx).await?;
            return Ok(Action::await_change());
        }
        debug!(
            in_progress = status.in_progress.len(),
            "Backup run still in progress"
        );
        return Ok(Action::requeue(RUN_POLL_INTERVAL));
    }

    start_run(&backup, &ctx).await
}

fn has_finalizer(backup: &CassandraBackup) -> bool {
    backup.finalizers().iter().any(|f| f == BACKUP_FINALIZER)
}

async fn ensure_finalizer(backup: CassandraBackup, ctx: &Context) -> Result<CassandraBackup> {
    if has_finalizer(&backup) {
        return Ok(backup);
    }
    let mut finalizers = backup.finalizers().to_vec();
    finalizers.push(BACKUP_FINALIZER.to_string());
    debug!("Adding backup finalizer");
    ctx.cluster.set_backup_finalizers(&backup, finalizers).await
}

/// Whether a run started longer ago than the configured stale timeout
fn run_is_stale(start_time: DateTime<Utc>, config: &OperatorConfig) -> bool {
    let Some(timeout) = config.stale_run_timeout else {
        return false;
    };
    (Utc::now() - start_time)
        .to_std()
        .is_ok_and(|age| age > timeout)
}

/// Start a new run: resolve nodes, persist the run, fan out, flush outcomes
async fn start_run(backup: &CassandraBackup, ctx: &Arc<Context>) -> Result<Action> {
    let namespace = backup.namespace().unwrap_or_else(|| "default".to_string());
    let datacenter = &backup.spec.cassandra_datacenter;

    let topology = match ctx.topology().resolve(&namespace, datacenter).await {
        Ok(topology) => topology,
        Err(e @ Error::SidecarNotDeployed { .. }) => {
            warn!(datacenter = %datacenter, error = %e, "Cannot start backup");
            ctx.events
                .publish(
                    &backup.object_ref(&()),
                    EventType::Warning,
                    "SidecarNotDeployed",
                    Some(e.to_string()),
                )
                .await;
            return Err(e);
        }
        Err(e) => return Err(e),
    };

    if topology.nodes.is_empty() {
        return Err(Error::not_found(
            "Pod",
            format!("datacenter {}/{} has no pods", namespace, datacenter),
        ));
    }

    let status = CassandraBackupStatus {
        start_time: Some(Utc::now()),
        in_progress: topology.nodes.iter().map(|n| n.name.clone()).collect(),
        cassdc_template_spec: Some(snapshot(&topology.datacenter)?),
        ..backup.status.clone().unwrap_or_default()
    };
    let running = ctx
        .cluster
        .patch_backup_status(backup, &status, Precondition::observed(backup))
        .await?;

    info!(
        datacenter = %datacenter,
        backup = %backup.spec.name,
        nodes = topology.nodes.len(),
        "Backup run started"
    );
    ctx.events
        .publish(
            &backup.object_ref(&()),
            EventType::Normal,
            "BackupStarted",
            Some(format!(
                "Backing up {} nodes of datacenter {}",
                topology.nodes.len(),
                datacenter
            )),
        )
        .await;

    let mut status = fan_out(
        ctx.agents.as_ref(),
        &topology.nodes,
        &backup.spec.name,
        backup.spec.backup_type,
        status,
        &namespace,
    )
    .await;
    if status.in_progress.is_empty() {
        status.finish_time = Some(Utc::now());
    }

    flush_outcomes(&running, &status, ctx).await?;
    record_finished(backup, &status, ctx).await;
    Ok(Action::await_change())
}

/// Capture the datacenter definition for later restores
fn snapshot(datacenter: &CassandraDatacenter) -> Result<DatacenterSnapshot> {
    Ok(DatacenterSnapshot {
        api_version: CassandraDatacenter::api_version(&()).to_string(),
        spec: serde_json::to_value(&datacenter.spec)?,
    })
}

/// Call every node's agent concurrently, folding each outcome into `status`
async fn fan_out(
    agents: &dyn AgentClientFactory,
    nodes: &[Node],
    backup_name: &str,
    mode: BackupType,
    status: CassandraBackupStatus,
    namespace: &str,
) -> CassandraBackupStatus {
    let aggregate = Mutex::new(status);
    let shared = &aggregate;

    let calls = nodes.iter().map(|node| async move {
        let result = backup_node(agents, node, backup_name, mode).await;
        match &result {
            Ok(()) => info!(node = %node.name, "Node backup finished"),
            Err(e) => warn!(node = %node.name, address = %node.address, error = %e, "Node backup failed"),
        }
        metrics::NODE_BACKUPS_TOTAL
            .with_label_values(&[metrics::outcome(result.is_ok()), namespace])
            .inc();
        shared.lock().await.record_outcome(&node.name, result.is_ok());
    });
    join_all(calls).await;

    aggregate.into_inner()
}

async fn backup_node(
    agents: &dyn AgentClientFactory,
    node: &Node,
    backup_name: &str,
    mode: BackupType,
) -> Result<()> {
    let client = agents.connect(&node.address).await?;
    client.create_backup(backup_name, mode).await
}

/// Persist the aggregated outcomes of a run
///
/// The run's side effects have already happened, so the write is unconditional
/// and retried on transient errors.
async fn flush_outcomes(
    running: &CassandraBackup,
    status: &CassandraBackupStatus,
    ctx: &Context,
) -> Result<()> {
    retry_with_backoff(
        &RetryConfig::default(),
        "flush backup status",
        Error::is_retryable,
        || async move {
            ctx.cluster
                .patch_backup_status(running, status, Precondition::None)
                .await
        },
    )
    .await?;
    Ok(())
}

/// Set finishTime once every node has reported
async fn complete_run(
    backup: &CassandraBackup,
    mut status: CassandraBackupStatus,
    ctx: &Context,
) -> Result<()> {
    status.finish_time = Some(Utc::now());
    ctx.cluster
        .patch_backup_status(backup, &status, Precondition::observed(backup))
        .await?;
    record_finished(backup, &status, ctx).await;
    Ok(())
}

/// Fail the nodes of a run that never flushed its outcomes and finish it
async fn recover_stranded_run(
    backup: &CassandraBackup,
    mut status: CassandraBackupStatus,
    ctx: &Context,
) -> Result<()> {
    let stranded = status.in_progress.clone();
    warn!(
        nodes = ?stranded,
        "Backup run exceeded the stale run timeout, marking remaining nodes failed"
    );
    for node in &stranded {
        status.record_outcome(node, false);
    }
    status.finish_time = Some(Utc::now());
    ctx.cluster
        .patch_backup_status(backup, &status, Precondition::observed(backup))
        .await?;
    record_finished(backup, &status, ctx).await;
    Ok(())
}

async fn record_finished(backup: &CassandraBackup, status: &CassandraBackupStatus, ctx: &Context) {
    let namespace = backup.namespace().unwrap_or_else(|| "default".to_string());
    let name = backup.name_any();
    let succeeded = status.failed.is_empty();

    metrics::BACKUPS_TOTAL
        .with_label_values(&[metrics::outcome(succeeded), &namespace, &name])
        .inc();
    if let (Some(start), Some(finish)) = (status.start_time, status.finish_time) {
        if let Ok(elapsed) = (finish - start).to_std() {
            metrics::BACKUP_DURATION
                .with_label_values(&[&namespace, &name])
                .observe(elapsed.as_secs_f64());
        }
    }

    info!(
        finished = status.finished.len(),
        failed = status.failed.len(),
        "Backup run finished"
    );
    let (type_, note) = if succeeded {
        (
            EventType::Normal,
            format!("Backup finished on {} nodes", status.finished.len()),
        )
    } else {
        (
            EventType::Warning,
            format!(
                "Backup finished with {} failed nodes: {}",
                status.failed.len(),
                status.failed.join(", ")
            ),
        )
    };
    ctx.events
        .publish(&backup.object_ref(&()), type_, "BackupFinished", Some(note))
        .await;
}

/// Marks a backup's deletion task as running in this process until dropped
struct DeletionGuard {
    key: String,
    ctx: Arc<Context>,
}

impl DeletionGuard {
    /// None if a deletion task for this backup is already running
    fn acquire(backup: &CassandraBackup, ctx: &Arc<Context>) -> Option<Self> {
        let key = format!(
            "{}/{}",
            backup.namespace().unwrap_or_default(),
            backup.name_any()
        );
        let mut running = ctx.deletions.lock().unwrap_or_else(PoisonError::into_inner);
        running.insert(key.clone()).then(|| Self {
            key,
            ctx: ctx.clone(),
        })
    }
}

impl Drop for DeletionGuard {
    fn drop(&mut self) {
        self.ctx
            .deletions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Drive deletion of a backup that still holds the finalizer
///
/// `deletionInProgress` without a running task means the process that started
/// the deletion went away, so the deletion is dispatched again.
async fn handle_deletion(backup: CassandraBackup, ctx: Arc<Context>) -> Result<Action> {
    if !has_finalizer(&backup) {
        return Ok(Action::await_change());
    }

    let Some(guard) = DeletionGuard::acquire(&backup, &ctx) else {
        debug!("Backup deletion in progress");
        return Ok(Action::requeue(DELETION_POLL_INTERVAL));
    };

    let status = backup.status.clone().unwrap_or_default();
    if status.deletion_in_progress {
        warn!(backup = %backup.spec.name, "Resuming interrupted backup deletion");
        dispatch_deletion(backup, guard, &ctx);
        return Ok(Action::requeue(DELETION_POLL_INTERVAL));
    }

    if let Some(start_time) = status.start_time {
        if status.is_running() && !run_is_stale(start_time, &ctx.config) {
            info!(
                in_progress = status.in_progress.len(),
                "Deferring deletion until the backup run drains"
            );
            return Ok(Action::requeue(RUN_POLL_INTERVAL));
        }
    }

    let marked_status = CassandraBackupStatus {
        deletion_in_progress: true,
        ..status
    };
    let marked = ctx
        .cluster
        .patch_backup_status(&backup, &marked_status, Precondition::observed(&backup))
        .await?;

    info!(backup = %marked.spec.name, "Deleting backup from remote storage");
    dispatch_deletion(marked, guard, &ctx);

    Ok(Action::requeue(DELETION_POLL_INTERVAL))
}

fn dispatch_deletion(backup: CassandraBackup, guard: DeletionGuard, ctx: &Arc<Context>) {
    let task_ctx = ctx.clone();
    ctx.tasks.spawn(async move {
        let _guard = guard;
        delete_remote_backup(backup, task_ctx).await
    });
}

/// Ask every agent node to delete the backup; release the finalizer on any success
async fn delete_remote_backup(backup: CassandraBackup, ctx: Arc<Context>) {
    let namespace = backup.namespace().unwrap_or_else(|| "default".to_string());
    let name = backup.name_any();

    let nodes = match ctx
        .topology()
        .resolve_agents(&namespace, &backup.spec.cassandra_datacenter)
        .await
    {
        Ok(nodes) => nodes,
        Err(e) => {
            warn!(name = %name, error = %e, "Failed to resolve nodes for backup deletion");
            Vec::new()
        }
    };

    let agents = ctx.agents.as_ref();
    let backup_name = backup.spec.name.as_str();
    let results = join_all(nodes.iter().map(|node| async move {
        let result = delete_on_node(agents, node, backup_name).await;
        if let Err(e) = &result {
            warn!(node = %node.name, error = %e, "Node backup deletion failed");
        }
        result
    }))
    .await;

    let deleted = results.iter().filter(|r| r.is_ok()).count();
    metrics::BACKUP_DELETIONS_TOTAL
        .with_label_values(&[metrics::outcome(deleted > 0), &namespace])
        .inc();

    if deleted == 0 {
        warn!(name = %name, nodes = nodes.len(), "Backup deletion failed on every node");
        tokio::time::sleep(ctx.config.deletion_retry_delay).await;
        if let Err(e) = clear_deletion_flag(&namespace, &name, &ctx).await {
            error!(name = %name, error = %e, "Failed to clear deletionInProgress");
        }
        return;
    }

    match release_finalizer(&namespace, &name, &ctx).await {
        Ok(()) => {
            info!(name = %name, nodes = deleted, "Backup deleted from remote storage");
            ctx.events
                .publish(
                    &backup.object_ref(&()),
                    EventType::Normal,
                    "BackupDeleted",
                    Some(format!("Backup deleted on {} of {} nodes", deleted, nodes.len())),
                )
                .await;
        }
        Err(e) => {
            error!(name = %name, error = %e, "Failed to remove backup finalizer");
            if let Err(e) = clear_deletion_flag(&namespace, &name, &ctx).await {
                error!(name = %name, error = %e, "Failed to clear deletionInProgress");
            }
        }
    }
}

async fn delete_on_node(agents: &dyn AgentClientFactory, node: &Node, backup_name: &str) -> Result<()> {
    let client = agents.connect(&node.address).await?;
    client.delete_backup(backup_name).await
}

/// Remove the finalizer, re-reading the object after each conflict
async fn release_finalizer(namespace: &str, name: &str, ctx: &Context) -> Result<()> {
    retry_with_backoff(
        &RetryConfig::default().initial_delay(Duration::from_millis(50)),
        "remove backup finalizer",
        Error::is_conflict,
        || async move {
            let Some(current) = ctx.cluster.get_backup(namespace, name).await? else {
                return Ok::<(), Error>(());
            };
            if !has_finalizer(&current) {
                return Ok(());
            }
            let finalizers = current
                .finalizers()
                .iter()
                .filter(|f| f.as_str() != BACKUP_FINALIZER)
                .cloned()
                .collect();
            ctx.cluster.set_backup_finalizers(&current, finalizers).await?;
            Ok(())
        },
    )
    .await
}

async fn clear_deletion_flag(namespace: &str, name: &str, ctx: &Context) -> Result<()> {
    let Some(current) = ctx.cluster.get_backup(namespace, name).await? else {
        return Ok(());
    };
    let status = CassandraBackupStatus {
        deletion_in_progress: false,
        ..current.status.clone().unwrap_or_default()
    };
    ctx.cluster
        .patch_backup_status(&current, &status, Precondition::None)
        .await?;
    Ok(())
}
