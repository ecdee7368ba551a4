//! Backup agent (Medusa sidecar) client
//!
//! Every Cassandra pod runs a gRPC sidecar exposing backup operations. The
//! orchestrators talk to it through [`AgentClient`], obtained per node address
//! from an [`AgentClientFactory`].

use std::time::Duration;

use async_trait::async_trait;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::BackupType;
use crate::error::{Error, Result};

/// Summary of one backup as reported by an agent
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupSummary {
    pub backup_name: String,
    pub start_time: i64,
    pub finish_time: i64,
    pub total_nodes: i32,
    pub finished_nodes: i32,
    pub status: String,
}

/// Operations exposed by the agent on a single node
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Take a backup with the given name, returning once it completes
    async fn create_backup(&self, name: &str, mode: BackupType) -> Result<()>;

    /// Delete the named backup from storage
    async fn delete_backup(&self, name: &str) -> Result<()>;

    /// List backups known to the agent
    ///
    /// Part of the agent protocol surface; the reconcilers track backups
    /// through the CassandraBackup status and do not call it.
    async fn get_backups(&self) -> Result<Vec<BackupSummary>>;
}

/// Creates agent clients for node addresses (`host:port`)
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AgentClientFactory: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Box<dyn AgentClient>>;
}

/// Generated messages and client of the agent's gRPC service
pub mod proto {
    #![allow(missing_docs)]
    tonic::include_proto!("_");
}

use proto::medusa_client::MedusaClient;

impl From<BackupType> for proto::backup_request::Mode {
    fn from(mode: BackupType) -> Self {
        match mode {
            BackupType::Differential => proto::backup_request::Mode::Differential,
            BackupType::Full => proto::backup_request::Mode::Full,
        }
    }
}

impl From<proto::BackupSummary> for BackupSummary {
    fn from(summary: proto::BackupSummary) -> Self {
        let status = proto::StatusType::try_from(summary.status)
            .unwrap_or(proto::StatusType::Unknown)
            .as_str_name()
            .to_string();
        Self {
            backup_name: summary.backup_name,
            start_time: summary.start_time,
            finish_time: summary.finish_time,
            total_nodes: summary.total_nodes,
            finished_nodes: summary.finished_nodes,
            status,
        }
    }
}

/// gRPC client for one agent
#[derive(Clone)]
pub struct GrpcAgentClient {
    inner: MedusaClient<Channel>,
}

impl GrpcAgentClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: MedusaClient::new(channel),
        }
    }
}

#[async_trait]
impl AgentClient for GrpcAgentClient {
    async fn create_backup(&self, name: &str, mode: BackupType) -> Result<()> {
        let request = proto::BackupRequest {
            name: name.to_string(),
            mode: proto::backup_request::Mode::from(mode) as i32,
        };
        self.inner.clone().backup(request).await?;
        Ok(())
    }

    async fn delete_backup(&self, name: &str) -> Result<()> {
        let request = proto::DeleteBackupRequest {
            name: name.to_string(),
        };
        self.inner.clone().delete_backup(request).await?;
        Ok(())
    }

    async fn get_backups(&self) -> Result<Vec<BackupSummary>> {
        let response = self
            .inner
            .clone()
            .get_backups(proto::GetBackupsRequest {})
            .await?
            .into_inner();
        Ok(response.backups.into_iter().map(BackupSummary::from).collect())
    }
}

/// Dials agents over plaintext gRPC
#[derive(Clone, Debug)]
pub struct GrpcAgentClientFactory {
    connect_timeout: Duration,
    request_timeout: Option<Duration>,
}

impl GrpcAgentClientFactory {
    pub fn new(connect_timeout: Duration, request_timeout: Option<Duration>) -> Self {
        Self {
            connect_timeout,
            request_timeout,
        }
    }
}

#[async_trait]
impl AgentClientFactory for GrpcAgentClientFactory {
    async fn connect(&self, address: &str) -> Result<Box<dyn AgentClient>> {
        debug!(address = %address, "Connecting to backup agent");

        let mut endpoint = Endpoint::from_shared(format!("http://{}", address))
            .map_err(Error::Transport)?
            .connect_timeout(self.connect_timeout);
        if let Some(timeout) = self.request_timeout {
            endpoint = endpoint.timeout(timeout);
        }

        let channel = endpoint.connect().await?;
        Ok(Box::new(GrpcAgentClient::new(channel)))
    }
}
