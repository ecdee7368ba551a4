//! Integrations with the cluster, the backup agents and the event stream

pub mod agent;
pub mod cluster;
pub mod events;
pub mod pod_template;
pub mod topology;

pub use agent::{AgentClient, AgentClientFactory, BackupSummary, GrpcAgentClientFactory};
pub use cluster::{ClusterClient, DatacenterPatch, KubeClusterClient, Precondition, FIELD_MANAGER};
pub use events::{EventPublisher, KubeEventPublisher};
pub use topology::{Node, Topology, TopologyResolver, AGENT_CONTAINER};
