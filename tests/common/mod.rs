//! In-memory collaborators for driving the reconcilers in tests

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ObjectReference, Pod, PodSpec, PodStatus, PodTemplateSpec, Service, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::ObjectMeta;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};

use cassandra_backup_operator::adapters::pod_template::RESTORE_CONTAINER;
use cassandra_backup_operator::adapters::{
    AgentClient, AgentClientFactory, BackupSummary, ClusterClient, DatacenterPatch, EventPublisher,
    Precondition, AGENT_CONTAINER,
};
use cassandra_backup_operator::controllers::Context;
use cassandra_backup_operator::crd::{
    BackupType, CassandraBackup, CassandraBackupStatus, CassandraDatacenter,
    CassandraDatacenterSpec, CassandraRestore, CassandraRestoreStatus, Rack, CLUSTER_LABEL,
    DATACENTER_LABEL,
};
use cassandra_backup_operator::{Error, OperatorConfig, Result};

pub const NAMESPACE: &str = "cass";
pub const CLUSTER: &str = "k8ssandra";

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn key_of<K: Resource>(obj: &K) -> Key {
    key(
        obj.meta().namespace.as_deref().unwrap_or("default"),
        obj.meta().name.as_deref().unwrap_or_default(),
    )
}

fn matches_labels(meta: &ObjectMeta, selector: &BTreeMap<String, String>) -> bool {
    let labels = meta.labels.clone().unwrap_or_default();
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

#[derive(Default)]
struct State {
    version: u64,
    backups: BTreeMap<Key, CassandraBackup>,
    restores: BTreeMap<Key, CassandraRestore>,
    frozen_restores: BTreeMap<Key, CassandraRestore>,
    datacenters: BTreeMap<Key, CassandraDatacenter>,
    services: BTreeMap<Key, Service>,
    pods: Vec<Pod>,
    stateful_sets: Vec<StatefulSet>,
    datacenter_patches: Vec<DatacenterPatch>,
}

impl State {
    fn bump<K: Resource>(&mut self, obj: &mut K) {
        self.version += 1;
        obj.meta_mut().resource_version = Some(self.version.to_string());
    }
}

fn check_precondition<K: Resource>(stored: &K, precondition: Precondition<'_>) -> Result<()> {
    match precondition {
        Precondition::ResourceVersion(rv) if stored.meta().resource_version.as_deref() != Some(rv) => {
            Err(Error::Conflict(format!(
                "{}/{}",
                stored.meta().namespace.as_deref().unwrap_or_default(),
                stored.meta().name.as_deref().unwrap_or_default()
            )))
        }
        _ => Ok(()),
    }
}

/// API server stand-in with resourceVersion preconditions and finalizers
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert_backup(&self, mut backup: CassandraBackup) {
        let mut state = self.state.lock().unwrap();
        state.bump(&mut backup);
        state.backups.insert(key_of(&backup), backup);
    }

    pub fn backup(&self, name: &str) -> Option<CassandraBackup> {
        self.state
            .lock()
            .unwrap()
            .backups
            .get(&key(NAMESPACE, name))
            .cloned()
    }

    /// Overwrite a backup's status outside the reconciler
    pub fn set_backup_status(&self, name: &str, status: CassandraBackupStatus) {
        let mut state = self.state.lock().unwrap();
        let mut backup = state.backups[&key(NAMESPACE, name)].clone();
        backup.status = Some(status);
        state.bump(&mut backup);
        state.backups.insert(key(NAMESPACE, name), backup);
    }

    /// Request deletion the way the API server does: objects with finalizers
    /// only get a deletionTimestamp
    pub fn delete_backup(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        let k = key(NAMESPACE, name);
        let Some(mut backup) = state.backups.get(&k).cloned() else {
            return;
        };
        if backup.finalizers().is_empty() {
            state.backups.remove(&k);
            return;
        }
        backup.metadata.deletion_timestamp = Some(Time(Utc::now()));
        state.bump(&mut backup);
        state.backups.insert(k, backup);
    }

    pub fn insert_restore(&self, mut restore: CassandraRestore) {
        let mut state = self.state.lock().unwrap();
        state.bump(&mut restore);
        state.restores.insert(key_of(&restore), restore);
    }

    pub fn restore(&self, name: &str) -> Option<CassandraRestore> {
        self.state
            .lock()
            .unwrap()
            .restores
            .get(&key(NAMESPACE, name))
            .cloned()
    }

    /// Serve the restore's current version to every later read, as a lagging
    /// watch cache would, while writes still check the stored version
    pub fn freeze_restore(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        let k = key(NAMESPACE, name);
        let current = state.restores[&k].clone();
        state.frozen_restores.insert(k, current);
    }

    pub fn restore_status(&self, name: &str) -> CassandraRestoreStatus {
        self.restore(name)
            .and_then(|r| r.status)
            .unwrap_or_default()
    }

    pub fn insert_datacenter(&self, mut datacenter: CassandraDatacenter) {
        let mut state = self.state.lock().unwrap();
        state.bump(&mut datacenter);
        state.datacenters.insert(key_of(&datacenter), datacenter);
    }

    pub fn datacenter(&self, name: &str) -> Option<CassandraDatacenter> {
        self.state
            .lock()
            .unwrap()
            .datacenters
            .get(&key(NAMESPACE, name))
            .cloned()
    }

    pub fn update_datacenter(&self, name: &str, update: impl FnOnce(&mut CassandraDatacenter)) {
        let mut state = self.state.lock().unwrap();
        let mut datacenter = state.datacenters[&key(NAMESPACE, name)].clone();
        update(&mut datacenter);
        state.bump(&mut datacenter);
        state.datacenters.insert(key(NAMESPACE, name), datacenter);
    }

    pub fn datacenter_patches(&self) -> Vec<DatacenterPatch> {
        self.state.lock().unwrap().datacenter_patches.clone()
    }

    pub fn insert_service(&self, service: Service) {
        let mut state = self.state.lock().unwrap();
        state.services.insert(key_of(&service), service);
    }

    pub fn insert_pod(&self, pod: Pod) {
        self.state.lock().unwrap().pods.push(pod);
    }

    pub fn remove_pods(&self) {
        self.state.lock().unwrap().pods.clear();
    }

    pub fn set_stateful_sets(&self, stateful_sets: Vec<StatefulSet>) {
        self.state.lock().unwrap().stateful_sets = stateful_sets;
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_backup(&self, namespace: &str, name: &str) -> Result<Option<CassandraBackup>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .backups
            .get(&key(namespace, name))
            .cloned())
    }

    async fn patch_backup_status(
        &self,
        backup: &CassandraBackup,
        status: &CassandraBackupStatus,
        precondition: Precondition<'_>,
    ) -> Result<CassandraBackup> {
        let mut state = self.state.lock().unwrap();
        let k = key_of(backup);
        let mut stored = state
            .backups
            .get(&k)
            .cloned()
            .ok_or_else(|| Error::not_found("CassandraBackup", k.1.clone()))?;
        check_precondition(&stored, precondition)?;
        stored.status = Some(status.clone());
        state.bump(&mut stored);
        state.backups.insert(k, stored.clone());
        Ok(stored)
    }

    async fn set_backup_finalizers(
        &self,
        backup: &CassandraBackup,
        finalizers: Vec<String>,
    ) -> Result<CassandraBackup> {
        let mut state = self.state.lock().unwrap();
        let k = key_of(backup);
        let mut stored = state
            .backups
            .get(&k)
            .cloned()
            .ok_or_else(|| Error::not_found("CassandraBackup", k.1.clone()))?;
        check_precondition(&stored, Precondition::observed(backup))?;
        stored.metadata.finalizers = Some(finalizers);
        if stored.metadata.deletion_timestamp.is_some() && stored.finalizers().is_empty() {
            state.backups.remove(&k);
            return Ok(stored);
        }
        state.bump(&mut stored);
        state.backups.insert(k, stored.clone());
        Ok(stored)
    }

    async fn get_restore(&self, namespace: &str, name: &str) -> Result<Option<CassandraRestore>> {
        let state = self.state.lock().unwrap();
        let k = key(namespace, name);
        Ok(state
            .frozen_restores
            .get(&k)
            .or_else(|| state.restores.get(&k))
            .cloned())
    }

    async fn patch_restore_status(
        &self,
        restore: &CassandraRestore,
        status: &CassandraRestoreStatus,
        precondition: Precondition<'_>,
    ) -> Result<CassandraRestore> {
        let mut state = self.state.lock().unwrap();
        let k = key_of(restore);
        let mut stored = state
            .restores
            .get(&k)
            .cloned()
            .ok_or_else(|| Error::not_found("CassandraRestore", k.1.clone()))?;
        check_precondition(&stored, precondition)?;
        stored.status = Some(status.clone());
        state.bump(&mut stored);
        state.restores.insert(k, stored.clone());
        Ok(stored)
    }

    async fn get_datacenter(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CassandraDatacenter>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .datacenters
            .get(&key(namespace, name))
            .cloned())
    }

    async fn create_datacenter(
        &self,
        datacenter: &CassandraDatacenter,
    ) -> Result<CassandraDatacenter> {
        let mut state = self.state.lock().unwrap();
        let k = key_of(datacenter);
        if state.datacenters.contains_key(&k) {
            return Err(Error::Conflict(format!("CassandraDatacenter {}", k.1)));
        }
        let mut created = datacenter.clone();
        state.bump(&mut created);
        state.datacenters.insert(k, created.clone());
        Ok(created)
    }

    async fn patch_datacenter(
        &self,
        namespace: &str,
        name: &str,
        patch: &DatacenterPatch,
    ) -> Result<CassandraDatacenter> {
        let mut state = self.state.lock().unwrap();
        let k = key(namespace, name);
        let mut stored = state
            .datacenters
            .get(&k)
            .cloned()
            .ok_or_else(|| Error::not_found("CassandraDatacenter", name))?;
        if let Some(stopped) = patch.stopped {
            stored.spec.stopped = stopped;
        }
        if let Some(template) = &patch.pod_template_spec {
            stored.spec.pod_template_spec = Some(template.clone());
        }
        if let Some(racks) = &patch.force_upgrade_racks {
            stored.spec.force_upgrade_racks = racks.clone();
        }
        state.datacenter_patches.push(patch.clone());
        state.bump(&mut stored);
        state.datacenters.insert(k, stored.clone());
        Ok(stored)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .services
            .get(&key(namespace, name))
            .cloned())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .pods
            .iter()
            .filter(|p| p.namespace().as_deref() == Some(namespace))
            .filter(|p| matches_labels(&p.metadata, labels))
            .cloned()
            .collect())
    }

    async fn list_stateful_sets(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<StatefulSet>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .stateful_sets
            .iter()
            .filter(|s| s.namespace().as_deref() == Some(namespace))
            .filter(|s| matches_labels(&s.metadata, labels))
            .cloned()
            .collect())
    }
}

/// One call made against an agent
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AgentCall {
    CreateBackup {
        address: String,
        name: String,
        mode: BackupType,
    },
    DeleteBackup {
        address: String,
        name: String,
    },
}

#[derive(Default)]
struct AgentState {
    calls: Vec<AgentCall>,
    failing: BTreeSet<String>,
}

/// Agent factory that records every call and fails on chosen addresses
#[derive(Clone, Default)]
pub struct RecordingAgents {
    state: Arc<Mutex<AgentState>>,
}

impl RecordingAgents {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_on(&self, address: &str) {
        self.state
            .lock()
            .unwrap()
            .failing
            .insert(address.to_string());
    }

    pub fn calls(&self) -> Vec<AgentCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn create_calls(&self) -> Vec<AgentCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, AgentCall::CreateBackup { .. }))
            .collect()
    }

    pub fn delete_calls(&self) -> Vec<AgentCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, AgentCall::DeleteBackup { .. }))
            .collect()
    }
}

struct RecordingAgent {
    address: String,
    state: Arc<Mutex<AgentState>>,
}

impl RecordingAgent {
    fn record(&self, call: AgentCall) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        if state.failing.contains(&self.address) {
            return Err(tonic::Status::internal("agent failure").into());
        }
        Ok(())
    }
}

#[async_trait]
impl AgentClient for RecordingAgent {
    async fn create_backup(&self, name: &str, mode: BackupType) -> Result<()> {
        self.record(AgentCall::CreateBackup {
            address: self.address.clone(),
            name: name.to_string(),
            mode,
        })
    }

    async fn delete_backup(&self, name: &str) -> Result<()> {
        self.record(AgentCall::DeleteBackup {
            address: self.address.clone(),
            name: name.to_string(),
        })
    }

    async fn get_backups(&self) -> Result<Vec<BackupSummary>> {
        Ok(Vec::new())
    }
}

#[async_trait]
impl AgentClientFactory for RecordingAgents {
    async fn connect(&self, address: &str) -> Result<Box<dyn AgentClient>> {
        Ok(Box::new(RecordingAgent {
            address: address.to_string(),
            state: self.state.clone(),
        }))
    }
}

/// Event sink keeping `(reason, is_warning)` pairs
#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<(String, bool)>>,
}

impl RecordingEvents {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(reason, _)| reason.clone())
            .collect()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, warning)| *warning)
            .map(|(reason, _)| reason.clone())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEvents {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _note: Option<String>,
    ) {
        self.events
            .lock()
            .unwrap()
            .push((reason.to_string(), matches!(type_, EventType::Warning)));
    }
}

/// Everything a test needs to drive the reconcilers
pub struct Harness {
    pub cluster: Arc<FakeCluster>,
    pub agents: Arc<RecordingAgents>,
    pub events: Arc<RecordingEvents>,
    pub ctx: Arc<Context>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: OperatorConfig) -> Self {
        let cluster = FakeCluster::new();
        let agents = RecordingAgents::new();
        let events = RecordingEvents::new();
        let ctx = Arc::new(Context::with_clients(
            cluster.clone(),
            agents.clone(),
            events.clone(),
            config,
        ));
        Self {
            cluster,
            agents,
            events,
            ctx,
        }
    }

    /// Wait for every background task spawned so far
    pub async fn drain_tasks(&self) {
        self.ctx.tasks.close();
        self.ctx.tasks.wait().await;
        self.ctx.tasks.reopen();
    }
}

pub fn test_config() -> OperatorConfig {
    OperatorConfig {
        deletion_retry_delay: Duration::ZERO,
        ..Default::default()
    }
}

pub fn datacenter_labels(datacenter: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (CLUSTER_LABEL.to_string(), CLUSTER.to_string()),
        (DATACENTER_LABEL.to_string(), datacenter.to_string()),
    ])
}

pub fn pod_template(with_restore_container: bool) -> PodTemplateSpec {
    let mut init_containers = vec![Container {
        name: "server-config-init".to_string(),
        ..Default::default()
    }];
    if with_restore_container {
        init_containers.push(Container {
            name: RESTORE_CONTAINER.to_string(),
            ..Default::default()
        });
    }
    PodTemplateSpec {
        metadata: None,
        spec: Some(PodSpec {
            containers: vec![Container {
                name: AGENT_CONTAINER.to_string(),
                ..Default::default()
            }],
            init_containers: Some(init_containers),
            ..Default::default()
        }),
    }
}

pub fn datacenter(name: &str, with_restore_container: bool) -> CassandraDatacenter {
    let mut dc = CassandraDatacenter::new(
        name,
        CassandraDatacenterSpec {
            cluster_name: CLUSTER.to_string(),
            size: 3,
            racks: vec![Rack {
                name: "rack1".to_string(),
                ..Default::default()
            }],
            pod_template_spec: Some(pod_template(with_restore_container)),
            ..Default::default()
        },
    );
    dc.metadata.namespace = Some(NAMESPACE.to_string());
    dc
}

pub fn all_pods_service(datacenter: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(format!("{}-{}-all-pods-service", CLUSTER, datacenter)),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(datacenter_labels(datacenter)),
            ..Default::default()
        }),
        status: None,
    }
}

pub fn pod(datacenter: &str, index: usize, with_agent: bool) -> Pod {
    let mut containers = vec![Container {
        name: "cassandra".to_string(),
        ..Default::default()
    }];
    if with_agent {
        containers.push(Container {
            name: AGENT_CONTAINER.to_string(),
            ..Default::default()
        });
    }
    Pod {
        metadata: ObjectMeta {
            name: Some(format!("{}-{}-rack1-sts-{}", CLUSTER, datacenter, index)),
            namespace: Some(NAMESPACE.to_string()),
            labels: Some(datacenter_labels(datacenter)),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers,
            ..Default::default()
        }),
        status: Some(PodStatus {
            pod_ip: Some(format!("10.0.0.{}", index + 1)),
            ..Default::default()
        }),
    }
}

pub fn node_name(datacenter: &str, index: usize) -> String {
    format!("{}-{}-rack1-sts-{}", CLUSTER, datacenter, index)
}

pub fn node_address(index: usize) -> String {
    format!("10.0.0.{}:50051", index + 1)
}

/// StatefulSet whose pod template is `template`
pub fn stateful_set(datacenter: &str, template: PodTemplateSpec) -> StatefulSet {
    StatefulSet {
        metadata: ObjectMeta {
            name: Some(format!("{}-{}-rack1-sts", CLUSTER, datacenter)),
            namespace: Some(NAMESPACE.to_string()),
            labels: Some(datacenter_labels(datacenter)),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            template,
            ..Default::default()
        }),
        status: None,
    }
}

/// A datacenter with its service and `nodes` pods
pub fn seed_datacenter(cluster: &FakeCluster, name: &str, nodes: usize) {
    cluster.insert_datacenter(datacenter(name, true));
    cluster.insert_service(all_pods_service(name));
    for i in 0..nodes {
        cluster.insert_pod(pod(name, i, true));
    }
}
