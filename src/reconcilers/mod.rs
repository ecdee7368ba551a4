//! Reconcilers for the backup and restore CRDs
//!
//! Each reconciler is level-triggered: it reloads its object, works out which
//! stage it is in from the persisted status, performs at most one stage
//! transition and returns the requeue action for the next call. Status writes
//! that move a stage forward carry the observed resourceVersion, so a stale
//! reconcile fails with a conflict instead of overwriting newer state.

pub mod backup;
pub mod restore;

use std::time::Duration;

use kube::runtime::controller::Action;

use crate::error::Error;

/// Requeue after losing an optimistic-concurrency race
pub const CONFLICT_BACKOFF: Duration = Duration::from_secs(1);

/// Requeue while a datacenter pod lacks the agent sidecar
pub const SIDECAR_BACKOFF: Duration = Duration::from_secs(60);

/// Requeue while a restore's datacenter lacks the restore init container
pub const MISCONFIGURED_BACKOFF: Duration = Duration::from_secs(60);

/// Requeue after a transient backup failure
pub const BACKUP_RETRY_BACKOFF: Duration = Duration::from_secs(30);

/// Requeue while restore progress is polled, and after transient restore failures
pub const RESTORE_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Requeue action for a failed backup reconcile
pub fn backup_error_action(error: &Error) -> Action {
    match error {
        e if e.is_conflict() => Action::requeue(CONFLICT_BACKOFF),
        Error::SidecarNotDeployed { .. } => Action::requeue(SIDECAR_BACKOFF),
        Error::NodeNotReady(_) => Action::requeue(backup::RUN_POLL_INTERVAL),
        e if !e.is_retryable() => Action::await_change(),
        _ => Action::requeue(BACKUP_RETRY_BACKOFF),
    }
}

/// Requeue action for a failed restore reconcile
pub fn restore_error_action(error: &Error) -> Action {
    match error {
        e if e.is_conflict() => Action::requeue(CONFLICT_BACKOFF),
        e if !e.is_retryable() => Action::await_change(),
        _ => Action::requeue(RESTORE_POLL_INTERVAL),
    }
}
