//! CassandraRestore reconciler
//!
//! Two paths lead to a restored datacenter:
//!
//! - **clone**: a new datacenter is created from the definition captured by
//!   the backup, with the restore init container pointed at the backup.
//! - **in place**: the live datacenter is optionally stopped, its pod template
//!   is patched to point the restore init container at the backup, the change
//!   is rolled out to every StatefulSet and the datacenter is started again.
//!
//! Either way the restore finishes once the datacenter reports ready. For the
//! in-place path the readiness must be fresh: an `Updating` condition that
//! went `False` before the restore started says nothing about the restore.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use kube::core::ObjectMeta;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::pod_template::{has_restore_env, inject_restore_env, restore_env_applied};
use crate::adapters::{DatacenterPatch, Precondition};
use crate::controllers::Context;
use crate::crd::{
    CassandraBackup, CassandraDatacenter, CassandraDatacenterSpec, CassandraRestore,
    CassandraRestoreStatus, DatacenterSnapshot,
};
use crate::error::{Error, Result};
use crate::metrics;
use crate::reconcilers::{MISCONFIGURED_BACKOFF, RESTORE_POLL_INTERVAL};

/// Reconcile one CassandraRestore
#[instrument(skip(ctx))]
pub async fn reconcile(namespace: &str, name: &str, ctx: Arc<Context>) -> Result<Action> {
    let Some(restore) = ctx.cluster.get_restore(namespace, name).await? else {
        debug!("CassandraRestore no longer exists");
        return Ok(Action::await_change());
    };

    let restore = ensure_restore_key(restore, &ctx).await?;
    let status = restore.status.clone().unwrap_or_default();

    if status.finish_time.is_some() {
        return Ok(Action::await_change());
    }

    let Some(start_time) = status.start_time else {
        let prepared = if restore.spec.in_place {
            prepare_in_place(&restore, &ctx).await
        } else {
            create_clone(&restore, &ctx).await
        };
        return match prepared {
            Err(Error::RestoreContainerNotFound(container)) => {
                report_missing_container(&restore, &container, &ctx).await
            }
            other => other,
        };
    };

    await_ready(&restore, start_time, &ctx).await
}

fn namespace_of(restore: &CassandraRestore) -> String {
    restore.namespace().unwrap_or_else(|| "default".to_string())
}

fn status_of(restore: &CassandraRestore) -> CassandraRestoreStatus {
    restore.status.clone().unwrap_or_default()
}

/// Assign the restore key once; every later side effect depends on it
async fn ensure_restore_key(restore: CassandraRestore, ctx: &Context) -> Result<CassandraRestore> {
    if restore
        .status
        .as_ref()
        .is_some_and(|s| !s.restore_key.is_empty())
    {
        return Ok(restore);
    }

    let status = CassandraRestoreStatus {
        restore_key: Uuid::new_v4().to_string(),
        ..status_of(&restore)
    };
    let updated = ctx
        .cluster
        .patch_restore_status(&restore, &status, Precondition::observed(&restore))
        .await?;
    info!(restore_key = %status.restore_key, "Assigned restore key");
    Ok(updated)
}

async fn fetch_backup(restore: &CassandraRestore, ctx: &Context) -> Result<CassandraBackup> {
    let namespace = namespace_of(restore);
    ctx.cluster
        .get_backup(&namespace, &restore.spec.backup)
        .await?
        .ok_or_else(|| {
            Error::not_found(
                "CassandraBackup",
                format!("{}/{}", namespace, restore.spec.backup),
            )
        })
}

/// Create a new datacenter from the backup's captured definition
async fn create_clone(restore: &CassandraRestore, ctx: &Context) -> Result<Action> {
    let backup = fetch_backup(restore, ctx).await?;
    let snapshot = backup
        .status
        .as_ref()
        .and_then(|s| s.cassdc_template_spec.as_ref())
        .ok_or_else(|| Error::SnapshotMissing(backup.name_any()))?;

    let datacenter = clone_datacenter(
        restore,
        snapshot,
        &backup.spec.name,
        &status_of(restore).restore_key,
    )?;

    match ctx.cluster.create_datacenter(&datacenter).await {
        Ok(_) => info!(datacenter = %datacenter.name_any(), "Created datacenter from backup"),
        Err(e) if e.is_conflict() => {
            if !existing_clone_matches(restore, &backup.spec.name, ctx).await? {
                let message = format!(
                    "CassandraDatacenter {}/{} already exists and was not created by this restore",
                    namespace_of(restore),
                    datacenter.name_any()
                );
                return finish_failed(restore, "DatacenterAlreadyExists", message, ctx).await;
            }
            info!(datacenter = %datacenter.name_any(), "Datacenter already created by this restore")
        }
        Err(e) => return Err(e),
    }

    mark_started(restore, ctx).await
}

/// Whether the datacenter occupying the clone's name carries this restore's env
async fn existing_clone_matches(
    restore: &CassandraRestore,
    backup_name: &str,
    ctx: &Context,
) -> Result<bool> {
    let namespace = namespace_of(restore);
    let existing = ctx
        .cluster
        .get_datacenter(&namespace, &restore.spec.cassandra_datacenter.name)
        .await?;
    Ok(existing
        .and_then(|dc| dc.spec.pod_template_spec)
        .is_some_and(|template| {
            has_restore_env(&template, backup_name, &status_of(restore).restore_key)
        }))
}

/// Build the datacenter a clone restore creates
pub fn clone_datacenter(
    restore: &CassandraRestore,
    snapshot: &DatacenterSnapshot,
    backup_name: &str,
    restore_key: &str,
) -> Result<CassandraDatacenter> {
    if snapshot.api_version != CassandraDatacenter::api_version(&()) {
        warn!(
            captured = %snapshot.api_version,
            "Datacenter snapshot was captured from a different API version"
        );
    }

    let mut spec: CassandraDatacenterSpec = serde_json::from_value(snapshot.spec.clone())?;
    spec.stopped = false;
    spec.force_upgrade_racks.clear();

    let template = spec
        .pod_template_spec
        .get_or_insert_with(Default::default);
    inject_restore_env(template, backup_name, restore_key)?;

    Ok(CassandraDatacenter {
        metadata: ObjectMeta {
            name: Some(restore.spec.cassandra_datacenter.name.clone()),
            namespace: Some(namespace_of(restore)),
            ..Default::default()
        },
        spec,
        status: None,
    })
}

/// Move an in-place restore one step toward a started restore
async fn prepare_in_place(restore: &CassandraRestore, ctx: &Context) -> Result<Action> {
    let namespace = namespace_of(restore);
    let status = status_of(restore);
    let dc_name = &restore.spec.cassandra_datacenter.name;

    let Some(datacenter) = ctx.cluster.get_datacenter(&namespace, dc_name).await? else {
        return finish_without_datacenter(restore, ctx).await;
    };

    if restore.spec.shutdown && status.datacenter_stopped.is_none() {
        return stop_datacenter(restore, &datacenter, ctx).await;
    }

    let backup = fetch_backup(restore, ctx).await?;
    let mut template = datacenter.spec.pod_template_spec.clone().unwrap_or_default();
    let changed = inject_restore_env(&mut template, &backup.spec.name, &status.restore_key)?;

    if changed {
        let patch = DatacenterPatch {
            pod_template_spec: Some(template),
            force_upgrade_racks: restore.spec.shutdown.then(|| datacenter.rack_names()),
            ..Default::default()
        };
        ctx.cluster
            .patch_datacenter(&namespace, dc_name, &patch)
            .await?;
        info!(
            datacenter = %dc_name,
            backup = %backup.spec.name,
            "Patched restore container environment"
        );
        return Ok(Action::requeue(RESTORE_POLL_INTERVAL));
    }

    let stateful_sets = ctx
        .cluster
        .list_stateful_sets(&namespace, &datacenter.datacenter_labels())
        .await?;
    if !restore_env_applied(&stateful_sets, &backup.spec.name, &status.restore_key) {
        debug!(datacenter = %dc_name, "Waiting for StatefulSets to pick up the restore");
        return Ok(Action::requeue(RESTORE_POLL_INTERVAL));
    }

    if datacenter.spec.stopped {
        let patch = DatacenterPatch {
            stopped: Some(false),
            ..Default::default()
        };
        ctx.cluster
            .patch_datacenter(&namespace, dc_name, &patch)
            .await?;
        info!(datacenter = %dc_name, "Starting datacenter");
    }

    mark_started(restore, ctx).await
}

/// Stop the datacenter and record when no pod is left running
async fn stop_datacenter(
    restore: &CassandraRestore,
    datacenter: &CassandraDatacenter,
    ctx: &Context,
) -> Result<Action> {
    let namespace = namespace_of(restore);
    let dc_name = datacenter.name_any();

    let pods = ctx
        .cluster
        .list_pods(&namespace, &datacenter.datacenter_labels())
        .await?;

    if pods.is_empty() {
        let status = CassandraRestoreStatus {
            datacenter_stopped: Some(Utc::now()),
            ..status_of(restore)
        };
        ctx.cluster
            .patch_restore_status(restore, &status, Precondition::observed(restore))
            .await?;
        info!(datacenter = %dc_name, "Datacenter is stopped");
        return Ok(Action::requeue(RESTORE_POLL_INTERVAL));
    }

    if datacenter.spec.stopped {
        debug!(datacenter = %dc_name, running = pods.len(), "Waiting for datacenter to stop");
        return Ok(Action::requeue(RESTORE_POLL_INTERVAL));
    }

    let patch = DatacenterPatch {
        stopped: Some(true),
        ..Default::default()
    };
    ctx.cluster
        .patch_datacenter(&namespace, &dc_name, &patch)
        .await?;
    info!(datacenter = %dc_name, "Stopping datacenter");
    Ok(Action::requeue(RESTORE_POLL_INTERVAL))
}

async fn mark_started(restore: &CassandraRestore, ctx: &Context) -> Result<Action> {
    let status = CassandraRestoreStatus {
        start_time: Some(Utc::now()),
        ..status_of(restore)
    };
    ctx.cluster
        .patch_restore_status(restore, &status, Precondition::observed(restore))
        .await?;

    info!(
        datacenter = %restore.spec.cassandra_datacenter.name,
        in_place = restore.spec.in_place,
        "Restore started"
    );
    ctx.events
        .publish(
            &restore.object_ref(&()),
            EventType::Normal,
            "RestoreStarted",
            Some(format!(
                "Restoring backup {} into datacenter {}",
                restore.spec.backup, restore.spec.cassandra_datacenter.name
            )),
        )
        .await;
    Ok(Action::requeue(RESTORE_POLL_INTERVAL))
}

/// Finish once the datacenter is ready again
async fn await_ready(
    restore: &CassandraRestore,
    start_time: DateTime<Utc>,
    ctx: &Context,
) -> Result<Action> {
    let namespace = namespace_of(restore);
    let dc_name = &restore.spec.cassandra_datacenter.name;

    let Some(datacenter) = ctx.cluster.get_datacenter(&namespace, dc_name).await? else {
        return finish_without_datacenter(restore, ctx).await;
    };

    if !restore_complete(restore, &datacenter, start_time) {
        debug!(datacenter = %dc_name, "Waiting for datacenter to become ready");
        return Ok(Action::requeue(RESTORE_POLL_INTERVAL));
    }

    let finish_time = finish_time_after(start_time);
    let status = CassandraRestoreStatus {
        finish_time: Some(finish_time),
        ..status_of(restore)
    };
    ctx.cluster
        .patch_restore_status(restore, &status, Precondition::observed(restore))
        .await?;

    let name = restore.name_any();
    metrics::RESTORES_TOTAL
        .with_label_values(&[metrics::OUTCOME_SUCCEEDED, &namespace, &name])
        .inc();
    if let Ok(elapsed) = (finish_time - start_time).to_std() {
        metrics::RESTORE_DURATION
            .with_label_values(&[&namespace, &name])
            .observe(elapsed.as_secs_f64());
    }

    info!(datacenter = %dc_name, "Restore finished");
    ctx.events
        .publish(
            &restore.object_ref(&()),
            EventType::Normal,
            "RestoreFinished",
            Some(format!("Datacenter {} is ready", dc_name)),
        )
        .await;
    Ok(Action::await_change())
}

/// Whether the datacenter's readiness reflects the restore
pub fn restore_complete(
    restore: &CassandraRestore,
    datacenter: &CassandraDatacenter,
    start_time: DateTime<Utc>,
) -> bool {
    if restore.spec.in_place {
        datacenter.is_ready() && datacenter.updated_after(start_time)
    } else {
        datacenter.is_ready()
    }
}

/// A finish time strictly after `start_time`, even if clocks disagree
fn finish_time_after(start_time: DateTime<Utc>) -> DateTime<Utc> {
    Utc::now().max(start_time + chrono::Duration::milliseconds(1))
}

/// End the restore because its target datacenter is gone
async fn finish_without_datacenter(restore: &CassandraRestore, ctx: &Context) -> Result<Action> {
    let message = format!(
        "CassandraDatacenter {}/{} not found",
        namespace_of(restore),
        restore.spec.cassandra_datacenter.name
    );
    finish_failed(restore, "DatacenterNotFound", message, ctx).await
}

/// Record a fatal outcome and stop reconciling
async fn finish_failed(
    restore: &CassandraRestore,
    reason: &str,
    message: String,
    ctx: &Context,
) -> Result<Action> {
    let namespace = namespace_of(restore);
    warn!(message = %message, "Restore cannot continue");

    let status = CassandraRestoreStatus {
        finish_time: Some(Utc::now()),
        message: Some(message.clone()),
        ..status_of(restore)
    };
    ctx.cluster
        .patch_restore_status(restore, &status, Precondition::observed(restore))
        .await?;

    metrics::RESTORES_TOTAL
        .with_label_values(&[metrics::OUTCOME_FAILED, &namespace, &restore.name_any()])
        .inc();
    ctx.events
        .publish(
            &restore.object_ref(&()),
            EventType::Warning,
            reason,
            Some(message),
        )
        .await;
    Ok(Action::await_change())
}

/// Surface a datacenter that is not set up for restores and check again later
async fn report_missing_container(
    restore: &CassandraRestore,
    container: &str,
    ctx: &Context,
) -> Result<Action> {
    let message = format!(
        "Datacenter {} has no {} init container; it is not configured for restores",
        restore.spec.cassandra_datacenter.name, container
    );
    warn!(message = %message, "Restore cannot continue");

    let status = status_of(restore);
    if status.message.as_deref() != Some(message.as_str()) {
        let status = CassandraRestoreStatus {
            message: Some(message.clone()),
            ..status
        };
        ctx.cluster
            .patch_restore_status(restore, &status, Precondition::observed(restore))
            .await?;
    }

    ctx.events
        .publish(
            &restore.object_ref(&()),
            EventType::Warning,
            "RestoreContainerNotFound",
            Some(message),
        )
        .await;
    Ok(Action::requeue(MISCONFIGURED_BACKOFF))
}
