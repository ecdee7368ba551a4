//! Datacenter topology discovery
//!
//! Resolves a CassandraDatacenter to the pods backing it, through the
//! datacenter's all-pods service. Topology is never cached: every backup run
//! and every deletion re-resolves it from the live cluster.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::debug;

use crate::adapters::ClusterClient;
use crate::crd::CassandraDatacenter;
use crate::error::{Error, Result};

/// Name of the backup agent sidecar container
pub const AGENT_CONTAINER: &str = "medusa";

/// One database node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    /// Pod name
    pub name: String,
    /// `podIP:agentPort`, empty when the pod has no IP yet
    pub address: String,
    /// Whether the pod runs the agent sidecar
    pub has_agent: bool,
}

/// A datacenter together with its member nodes
#[derive(Clone, Debug)]
pub struct Topology {
    pub datacenter: CassandraDatacenter,
    pub nodes: Vec<Node>,
}

/// Discovers the nodes of a datacenter
#[derive(Clone)]
pub struct TopologyResolver {
    cluster: Arc<dyn ClusterClient>,
    agent_port: u16,
}

impl TopologyResolver {
    pub fn new(cluster: Arc<dyn ClusterClient>, agent_port: u16) -> Self {
        Self {
            cluster,
            agent_port,
        }
    }

    /// Resolve every node of the datacenter, requiring the agent on all of them
    ///
    /// Fails with [`Error::SidecarNotDeployed`] if any pod lacks the agent; no
    /// partial result is returned.
    pub async fn resolve(&self, namespace: &str, datacenter: &str) -> Result<Topology> {
        let (datacenter, pods) = self.datacenter_pods(namespace, datacenter).await?;
        let nodes = nodes_from_pods(&pods, self.agent_port);
        require_agents(&nodes)?;
        Ok(Topology { datacenter, nodes })
    }

    /// Resolve the nodes that carry the agent and have an address, skipping
    /// the rest
    pub async fn resolve_agents(&self, namespace: &str, datacenter: &str) -> Result<Vec<Node>> {
        let (_, pods) = self.datacenter_pods(namespace, datacenter).await?;
        Ok(nodes_from_pods(&pods, self.agent_port)
            .into_iter()
            .filter(|n| n.has_agent && !n.address.is_empty())
            .collect())
    }

    async fn datacenter_pods(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(CassandraDatacenter, Vec<Pod>)> {
        let datacenter = self
            .cluster
            .get_datacenter(namespace, name)
            .await?
            .ok_or_else(|| Error::not_found("CassandraDatacenter", format!("{}/{}", namespace, name)))?;

        let service_name = datacenter.all_pods_service_name();
        let service = self
            .cluster
            .get_service(namespace, &service_name)
            .await?
            .ok_or_else(|| Error::not_found("Service", format!("{}/{}", namespace, service_name)))?;

        let selector: BTreeMap<String, String> = service
            .spec
            .and_then(|s| s.selector)
            .unwrap_or_default();
        if selector.is_empty() {
            return Err(Error::config(format!(
                "Service {}/{} has no pod selector",
                namespace, service_name
            )));
        }

        let pods = self.cluster.list_pods(namespace, &selector).await?;
        debug!(
            datacenter = %name,
            service = %service_name,
            pods = pods.len(),
            "Resolved datacenter pods"
        );
        Ok((datacenter, pods))
    }
}

/// Build nodes from pods, sorted by name
pub fn nodes_from_pods(pods: &[Pod], agent_port: u16) -> Vec<Node> {
    let mut nodes: Vec<Node> = pods
        .iter()
        .map(|pod| {
            let has_agent = pod
                .spec
                .as_ref()
                .is_some_and(|s| s.containers.iter().any(|c| c.name == AGENT_CONTAINER));
            let address = pod
                .status
                .as_ref()
                .and_then(|s| s.pod_ip.as_deref())
                .filter(|ip| !ip.is_empty())
                .map(|ip| format!("{}:{}", ip, agent_port))
                .unwrap_or_default();
            Node {
                name: pod.name_any(),
                address,
                has_agent,
            }
        })
        .collect();
    nodes.sort_by(|a, b| a.name.cmp(&b.name));
    nodes
}

/// All-or-nothing agent check; a missing sidecar wins over a missing IP
fn require_agents(nodes: &[Node]) -> Result<()> {
    if let Some(node) = nodes.iter().find(|n| !n.has_agent) {
        return Err(Error::SidecarNotDeployed {
            pod: node.name.clone(),
            container: AGENT_CONTAINER.to_string(),
        });
    }
    if let Some(node) = nodes.iter().find(|n| n.address.is_empty()) {
        return Err(Error::NodeNotReady(node.name.clone()));
    }
    Ok(())
}
