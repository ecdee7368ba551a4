//! CassandraBackup Custom Resource Definition

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::preserve_unknown_fields;

/// CassandraBackup resource specification
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cassandra.k8ssandra.io",
    version = "v1alpha1",
    kind = "CassandraBackup",
    plural = "cassandrabackups",
    singular = "cassandrabackup",
    shortname = "cbkp",
    namespaced,
    status = "CassandraBackupStatus",
    printcolumn = r#"{"name": "Datacenter", "type": "string", "jsonPath": ".spec.cassandraDatacenter"}"#,
    printcolumn = r#"{"name": "Started", "type": "date", "jsonPath": ".status.startTime"}"#,
    printcolumn = r#"{"name": "Finished", "type": "date", "jsonPath": ".status.finishTime"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CassandraBackupSpec {
    /// Name of the backup as known to the agents
    pub name: String,

    /// Name of the CassandraDatacenter to back up
    pub cassandra_datacenter: String,

    /// Backup mode passed to the agents
    #[serde(default)]
    pub backup_type: BackupType,
}

/// Backup mode
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    /// Only upload files not already present in storage
    #[default]
    Differential,
    /// Upload every file
    Full,
}

/// CassandraBackup status
///
/// Node sets are kept sorted so repeated patches of the same content are
/// byte-identical.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CassandraBackupStatus {
    /// When the backup run started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    /// When every node reported an outcome
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_time: Option<DateTime<Utc>>,

    /// Nodes whose backup call has not returned yet
    #[serde(default)]
    pub in_progress: Vec<String>,

    /// Nodes whose backup call succeeded
    #[serde(default)]
    pub finished: Vec<String>,

    /// Nodes whose backup call failed
    #[serde(default)]
    pub failed: Vec<String>,

    /// Remote deletion is underway
    #[serde(default)]
    pub deletion_in_progress: bool,

    /// Definition of the datacenter at the time of the backup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cassdc_template_spec: Option<DatacenterSnapshot>,
}

/// Opaque copy of a datacenter definition
///
/// The spec is kept as raw JSON so fields added to the datacenter schema
/// survive a backup/restore cycle without changes here.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatacenterSnapshot {
    /// apiVersion of the captured object
    pub api_version: String,

    /// Captured spec
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub spec: serde_json::Value,
}

impl CassandraBackupStatus {
    /// Whether a run has started and not every node has reported
    pub fn is_running(&self) -> bool {
        self.start_time.is_some() && !self.in_progress.is_empty()
    }

    /// Move a node from in-progress to finished or failed
    pub fn record_outcome(&mut self, node: &str, succeeded: bool) {
        self.in_progress.retain(|n| n != node);
        let target = if succeeded {
            &mut self.finished
        } else {
            &mut self.failed
        };
        if let Err(idx) = target.binary_search_by(|n| n.as_str().cmp(node)) {
            target.insert(idx, node.to_string());
        }
    }
}
