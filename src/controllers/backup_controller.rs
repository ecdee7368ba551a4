//! CassandraBackup controller
//!
//! Watches CassandraBackup resources and triggers reconciliation.

use std::sync::Arc;

use futures::StreamExt;
use kube::{
    api::ListParams,
    runtime::{
        controller::{Action, Controller},
        watcher::Config as WatcherConfig,
    },
    Api, Client, ResourceExt,
};
use tracing::{debug, error, info, instrument};

use crate::controllers::{watched_api, Context};
use crate::crd::CassandraBackup;
use crate::error::{Error, Result};
use crate::metrics;
use crate::reconcilers::{backup as backup_reconciler, backup_error_action};

const KIND: &str = "CassandraBackup";

/// Run the CassandraBackup controller
pub async fn run(client: Client, context: Arc<Context>) {
    let api: Api<CassandraBackup> =
        watched_api(client, context.config.watch_namespace.as_deref());

    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("CassandraBackup CRD not installed: {}", e);
        return;
    }

    info!("Starting CassandraBackup controller");

    Controller::new(api, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    debug!(
                        name = %obj.name,
                        namespace = obj.namespace.as_deref().unwrap_or("default"),
                        "Reconciled CassandraBackup"
                    );
                }
                Err(e) => {
                    debug!(error = %e, "Reconciliation error");
                }
            }
        })
        .await;
}

#[instrument(skip(obj, ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<CassandraBackup>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = metrics::RECONCILE_DURATION
        .with_label_values(&[KIND])
        .start_timer();
    metrics::RECONCILIATIONS.with_label_values(&[KIND]).inc();

    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    backup_reconciler::reconcile(&namespace, &obj.name_any(), ctx).await
}

fn error_policy(obj: Arc<CassandraBackup>, error: &Error, _ctx: Arc<Context>) -> Action {
    metrics::RECONCILIATION_ERRORS.with_label_values(&[KIND]).inc();
    let name = obj.name_any();

    if error.is_conflict() {
        debug!(name = %name, error = %error, "Conflicting update, retrying");
    } else {
        error!(name = %name, error = %error, "Reconciliation failed, scheduling retry");
    }

    backup_error_action(error)
}
