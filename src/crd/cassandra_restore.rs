//! CassandraRestore Custom Resource Definition

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// CassandraRestore resource specification
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cassandra.k8ssandra.io",
    version = "v1alpha1",
    kind = "CassandraRestore",
    plural = "cassandrarestores",
    singular = "cassandrarestore",
    shortname = "crst",
    namespaced,
    status = "CassandraRestoreStatus",
    printcolumn = r#"{"name": "Backup", "type": "string", "jsonPath": ".spec.backup"}"#,
    printcolumn = r#"{"name": "Datacenter", "type": "string", "jsonPath": ".spec.cassandraDatacenter.name"}"#,
    printcolumn = r#"{"name": "In Place", "type": "boolean", "jsonPath": ".spec.inPlace"}"#,
    printcolumn = r#"{"name": "Finished", "type": "date", "jsonPath": ".status.finishTime"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CassandraRestoreSpec {
    /// Name of the CassandraBackup to restore from
    pub backup: String,

    /// Datacenter to restore into
    pub cassandra_datacenter: CassandraDatacenterConfig,

    /// Restore into the existing datacenter instead of creating a new one
    #[serde(default)]
    pub in_place: bool,

    /// Stop the datacenter before applying the restore
    #[serde(default)]
    pub shutdown: bool,
}

/// Target datacenter descriptor
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CassandraDatacenterConfig {
    /// Datacenter name
    pub name: String,

    /// Cassandra cluster name
    #[serde(default)]
    pub cluster_name: String,
}

/// CassandraRestore status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CassandraRestoreStatus {
    /// Unique key handed to the restore init container
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub restore_key: String,

    /// When the datacenter was observed fully stopped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacenter_stopped: Option<DateTime<Utc>>,

    /// When the restore was applied to the datacenter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    /// When the datacenter came back ready after the restore
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_time: Option<DateTime<Utc>>,

    /// Reason the restore ended without reaching a ready datacenter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
