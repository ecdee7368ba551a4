//! CassandraRestore controller

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
use crate::crd::CassandraRestore;
use crate::error::{Error, Result};
use crate::metrics;
use crate::reconcilers::{restore as restore_reconciler, restore_error_action};

const KIND: &str = "CassandraRestore";

/// Run the CassandraRestore controller
pub async fn run(client: Client, context: Arc<Context>) {
    let api: Api<CassandraRestore> =
        watched_api(client, context.config.watch_namespace.as_deref());

    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("CassandraRestore CRD not installed: {}", e);
        return;
    }

    info!("Starting CassandraRestore controller");

    Controller::new(api, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            if let Ok((obj, _action)) = result {
                debug!(
                    name = %obj.name,
                    namespace = obj.namespace.as_deref().unwrap_or("default"),
                    "Reconciled CassandraRestore"
                );
            }
        })
        .await;
}

#[instrument(skip(obj, ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<CassandraRestore>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = metrics::RECONCILE_DURATION
        .with_label_values(&[KIND])
        .start_timer();
    metrics::RECONCILIATIONS.with_label_values(&[KIND]).inc();

    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    restore_reconciler::reconcile(&namespace, &obj.name_any(), ctx).await
}

fn error_policy(obj: Arc<CassandraRestore>, error: &Error, _ctx: Arc<Context>) -> Action {
    metrics::RECONCILIATION_ERRORS.with_label_values(&[KIND]).inc();
    let name = obj.name_any();

    match error {
        e if e.is_conflict() => {
            debug!(name = %name, error = %e, "Conflicting update, retrying")
        }
        e if !e.is_retryable() => {
            error!(name = %name, error = %e, "Reconciliation failed, waiting for a change")
        }
        e => error!(name = %name, error = %e, "Reconciliation failed, scheduling retry"),
    }

    restore_error_action(error)
}
