//! Kubernetes controllers for the backup and restore CRDs
//!
//! Each controller watches one resource kind and hands every change to the
//! matching reconciler.

mod backup_controller;
mod restore_controller;

pub use backup_controller::run as run_backup_controller;
pub use restore_controller::run as run_restore_controller;

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use kube::{Api, Client, Resource};
use tokio_util::task::TaskTracker;

use crate::adapters::{
    AgentClientFactory, ClusterClient, EventPublisher, GrpcAgentClientFactory,
    KubeClusterClient, KubeEventPublisher, TopologyResolver,
};
use crate::config::OperatorConfig;

/// Name reported as the source of emitted events
pub const CONTROLLER_NAME: &str = "cassandra-backup-operator";

/// Shared context for all controllers
pub struct Context {
    /// Object store access
    pub cluster: Arc<dyn ClusterClient>,
    /// Dials the backup agent on each node
    pub agents: Arc<dyn AgentClientFactory>,
    /// Event sink for user-visible progress
    pub events: Arc<dyn EventPublisher>,
    pub config: OperatorConfig,
    /// Background backup deletions
    pub tasks: TaskTracker,
    /// `namespace/name` of backups whose deletion task is running in this process
    pub(crate) deletions: Mutex<BTreeSet<String>>,
}

impl Context {
    /// Create a context talking to a live cluster
    pub fn new(client: Client, config: OperatorConfig) -> Self {
        let agents = GrpcAgentClientFactory::new(
            config.agent_connect_timeout,
            config.agent_request_timeout,
        );
        Self::with_clients(
            Arc::new(KubeClusterClient::new(client.clone())),
            Arc::new(agents),
            Arc::new(KubeEventPublisher::new(client, CONTROLLER_NAME)),
            config,
        )
    }

    /// Create a context from explicit collaborators
    pub fn with_clients(
        cluster: Arc<dyn ClusterClient>,
        agents: Arc<dyn AgentClientFactory>,
        events: Arc<dyn EventPublisher>,
        config: OperatorConfig,
    ) -> Self {
        Self {
            cluster,
            agents,
            events,
            config,
            tasks: TaskTracker::new(),
            deletions: Mutex::new(BTreeSet::new()),
        }
    }

    /// Topology resolver bound to this context's cluster and agent port
    pub fn topology(&self) -> TopologyResolver {
        TopologyResolver::new(self.cluster.clone(), self.config.agent_port)
    }
}

/// Api scoped to the watched namespace, or cluster-wide
pub(crate) fn watched_api<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = kube::core::NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}
