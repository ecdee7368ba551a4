//! Restore init container configuration
//!
//! The agent's restore init container reads the backup to restore and the
//! restore key from its environment. These helpers set and verify those
//! values on a pod template.

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Container, EnvVar, PodTemplateSpec};

use crate::error::{Error, Result};

/// Init container that restores data before Cassandra starts
pub const RESTORE_CONTAINER: &str = "medusa-restore";

/// Env var naming the backup to restore
pub const BACKUP_NAME_ENV: &str = "BACKUP_NAME";

/// Env var carrying the restore idempotency key
pub const RESTORE_KEY_ENV: &str = "RESTORE_KEY";

fn restore_container(template: &PodTemplateSpec) -> Option<&Container> {
    template
        .spec
        .as_ref()?
        .init_containers
        .as_ref()?
        .iter()
        .find(|c| c.name == RESTORE_CONTAINER)
}

fn restore_container_mut(template: &mut PodTemplateSpec) -> Option<&mut Container> {
    template
        .spec
        .as_mut()?
        .init_containers
        .as_mut()?
        .iter_mut()
        .find(|c| c.name == RESTORE_CONTAINER)
}

fn has_env(container: &Container, name: &str, value: &str) -> bool {
    container
        .env
        .as_ref()
        .and_then(|env| env.iter().find(|e| e.name == name))
        .is_some_and(|e| e.value.as_deref() == Some(value))
}

/// Set `name=value`, replacing any existing entry. Returns whether anything changed.
fn set_env(container: &mut Container, name: &str, value: &str) -> bool {
    let env = container.env.get_or_insert_with(Vec::new);
    match env.iter_mut().find(|e| e.name == name) {
        Some(var) if var.value.as_deref() == Some(value) && var.value_from.is_none() => false,
        Some(var) => {
            var.value = Some(value.to_string());
            var.value_from = None;
            true
        }
        None => {
            env.push(EnvVar {
                name: name.to_string(),
                value: Some(value.to_string()),
                value_from: None,
            });
            true
        }
    }
}

/// Point the restore init container at a backup
///
/// Returns whether the template changed, so callers can skip a no-op patch.
pub fn inject_restore_env(
    template: &mut PodTemplateSpec,
    backup_name: &str,
    restore_key: &str,
) -> Result<bool> {
    let container = restore_container_mut(template)
        .ok_or_else(|| Error::RestoreContainerNotFound(RESTORE_CONTAINER.to_string()))?;

    let backup_changed = set_env(container, BACKUP_NAME_ENV, backup_name);
    let key_changed = set_env(container, RESTORE_KEY_ENV, restore_key);
    Ok(backup_changed || key_changed)
}

/// Whether a template's restore container already carries both values
pub fn has_restore_env(template: &PodTemplateSpec, backup_name: &str, restore_key: &str) -> bool {
    restore_container(template).is_some_and(|c| {
        has_env(c, BACKUP_NAME_ENV, backup_name) && has_env(c, RESTORE_KEY_ENV, restore_key)
    })
}

/// Whether every StatefulSet has picked up the restore env values
///
/// An empty list is never converged: the datacenter's StatefulSets always exist
/// once cass-operator has reconciled it.
pub fn restore_env_applied(
    stateful_sets: &[StatefulSet],
    backup_name: &str,
    restore_key: &str,
) -> bool {
    !stateful_sets.is_empty()
        && stateful_sets.iter().all(|sts| {
            sts.spec
                .as_ref()
                .is_some_and(|s| has_restore_env(&s.template, backup_name, restore_key))
        })
}
