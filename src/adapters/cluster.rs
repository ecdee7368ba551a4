//! Kubernetes object access used by the orchestrators
//!
//! [`ClusterClient`] is the only path through which reconcilers read or write
//! cluster state, so tests can swap in an in-memory implementation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Pod, PodTemplateSpec, Service};
use kube::{
    api::{ListParams, Patch, PatchParams, PostParams},
    Api, Client, Resource, ResourceExt,
};
use serde::Serialize;
use serde_json::json;

use crate::crd::{
    CassandraBackup, CassandraBackupStatus, CassandraDatacenter, CassandraRestore,
    CassandraRestoreStatus,
};
use crate::error::{conflict_on, optional, Result};

/// Field manager recorded on every write
pub const FIELD_MANAGER: &str = "cassandra-backup-operator";

/// Partial update of a CassandraDatacenter spec
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatacenterPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_template_spec: Option<PodTemplateSpec>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub force_upgrade_racks: Option<Vec<String>>,
}

/// How a status write is guarded against concurrent writers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Precondition<'a> {
    /// Fail with a conflict unless the object still has this resourceVersion
    ResourceVersion(&'a str),
    /// Write regardless of intervening changes
    None,
}

impl<'a> Precondition<'a> {
    /// Guard on the version the caller last observed
    pub fn observed<K: Resource>(obj: &'a K) -> Self {
        obj.meta()
            .resource_version
            .as_deref()
            .map_or(Precondition::None, Precondition::ResourceVersion)
    }
}

/// Object store operations required by the backup and restore orchestrators
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_backup(&self, namespace: &str, name: &str) -> Result<Option<CassandraBackup>>;

    /// Replace the backup status, returning the updated object
    async fn patch_backup_status(
        &self,
        backup: &CassandraBackup,
        status: &CassandraBackupStatus,
        precondition: Precondition<'_>,
    ) -> Result<CassandraBackup>;

    /// Replace the finalizer list, guarded by the observed resourceVersion
    async fn set_backup_finalizers(
        &self,
        backup: &CassandraBackup,
        finalizers: Vec<String>,
    ) -> Result<CassandraBackup>;

    async fn get_restore(&self, namespace: &str, name: &str) -> Result<Option<CassandraRestore>>;

    /// Replace the restore status, returning the updated object
    async fn patch_restore_status(
        &self,
        restore: &CassandraRestore,
        status: &CassandraRestoreStatus,
        precondition: Precondition<'_>,
    ) -> Result<CassandraRestore>;

    async fn get_datacenter(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CassandraDatacenter>>;

    async fn create_datacenter(&self, datacenter: &CassandraDatacenter)
        -> Result<CassandraDatacenter>;

    async fn patch_datacenter(
        &self,
        namespace: &str,
        name: &str,
        patch: &DatacenterPatch,
    ) -> Result<CassandraDatacenter>;

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;

    async fn list_pods(&self, namespace: &str, labels: &BTreeMap<String, String>)
        -> Result<Vec<Pod>>;

    async fn list_stateful_sets(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<StatefulSet>>;
}

/// [`ClusterClient`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Build a status merge patch, carrying the resourceVersion precondition
fn status_patch<S: Serialize>(status: &S, precondition: Precondition<'_>) -> serde_json::Value {
    match precondition {
        Precondition::ResourceVersion(rv) => json!({
            "metadata": { "resourceVersion": rv },
            "status": status,
        }),
        Precondition::None => json!({ "status": status }),
    }
}

/// Render labels as an equality-based selector
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_backup(&self, namespace: &str, name: &str) -> Result<Option<CassandraBackup>> {
        let api: Api<CassandraBackup> = Api::namespaced(self.client.clone(), namespace);
        optional(api.get(name).await)
    }

    async fn patch_backup_status(
        &self,
        backup: &CassandraBackup,
        status: &CassandraBackupStatus,
        precondition: Precondition<'_>,
    ) -> Result<CassandraBackup> {
        let name = backup.name_any();
        let namespace = backup.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<CassandraBackup> = Api::namespaced(self.client.clone(), &namespace);

        let patch = status_patch(status, precondition);
        conflict_on(
            api.patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
                .await,
            format!("CassandraBackup {}/{}", namespace, name),
        )
    }

    async fn set_backup_finalizers(
        &self,
        backup: &CassandraBackup,
        finalizers: Vec<String>,
    ) -> Result<CassandraBackup> {
        let name = backup.name_any();
        let namespace = backup.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<CassandraBackup> = Api::namespaced(self.client.clone(), &namespace);

        let patch = json!({
            "metadata": {
                "resourceVersion": backup.resource_version(),
                "finalizers": finalizers,
            }
        });
        conflict_on(
            api.patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
                .await,
            format!("CassandraBackup {}/{}", namespace, name),
        )
    }

    async fn get_restore(&self, namespace: &str, name: &str) -> Result<Option<CassandraRestore>> {
        let api: Api<CassandraRestore> = Api::namespaced(self.client.clone(), namespace);
        optional(api.get(name).await)
    }

    async fn patch_restore_status(
        &self,
        restore: &CassandraRestore,
        status: &CassandraRestoreStatus,
        precondition: Precondition<'_>,
    ) -> Result<CassandraRestore> {
        let name = restore.name_any();
        let namespace = restore.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<CassandraRestore> = Api::namespaced(self.client.clone(), &namespace);

        let patch = status_patch(status, precondition);
        conflict_on(
            api.patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
                .await,
            format!("CassandraRestore {}/{}", namespace, name),
        )
    }

    async fn get_datacenter(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CassandraDatacenter>> {
        let api: Api<CassandraDatacenter> = Api::namespaced(self.client.clone(), namespace);
        optional(api.get(name).await)
    }

    async fn create_datacenter(
        &self,
        datacenter: &CassandraDatacenter,
    ) -> Result<CassandraDatacenter> {
        let namespace = datacenter.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<CassandraDatacenter> = Api::namespaced(self.client.clone(), &namespace);
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        conflict_on(
            api.create(&params, datacenter).await,
            format!("CassandraDatacenter {}/{}", namespace, datacenter.name_any()),
        )
    }

    async fn patch_datacenter(
        &self,
        namespace: &str,
        name: &str,
        patch: &DatacenterPatch,
    ) -> Result<CassandraDatacenter> {
        let api: Api<CassandraDatacenter> = Api::namespaced(self.client.clone(), namespace);
        let body = json!({ "spec": patch });
        Ok(api
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&body))
            .await?)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        optional(api.get(name).await)
    }

    async fn list_pods(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&label_selector(labels));
        Ok(api.list(&params).await?.items)
    }

    async fn list_stateful_sets(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<StatefulSet>> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&label_selector(labels));
        Ok(api.list(&params).await?.items)
    }
}
