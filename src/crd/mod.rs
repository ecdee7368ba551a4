//! Custom Resource Definitions for the Cassandra Backup Operator

mod cassandra_backup;
mod cassandra_datacenter;
mod cassandra_restore;

pub use cassandra_backup::*;
pub use cassandra_datacenter::*;
pub use cassandra_restore::*;

use kube::CustomResourceExt;
use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};

/// Generate all CRD YAML manifests owned by this operator
pub fn generate_crds() -> Result<Vec<String>, serde_yaml::Error> {
    Ok(vec![
        serde_yaml::to_string(&CassandraBackup::crd())?,
        serde_yaml::to_string(&CassandraRestore::crd())?,
    ])
}

/// Schema for free-form objects the API server must store verbatim
pub(crate) fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(schema)
}
