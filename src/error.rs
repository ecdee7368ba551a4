//! Error types for the Cassandra Backup Operator

use thiserror::Error;

/// Result type alias using the operator's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Operator error types
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// The object being reconciled, or one it references, does not exist
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// Optimistic-concurrency precondition failed
    #[error("Conflict updating {0}: object was modified concurrently")]
    Conflict(String),

    /// A datacenter pod is missing the backup agent container
    #[error("Pod {pod} does not have the {container} sidecar container")]
    SidecarNotDeployed { pod: String, container: String },

    /// A datacenter pod has not been assigned an IP address yet
    #[error("Pod {0} has no IP address assigned")]
    NodeNotReady(String),

    /// The datacenter pod template is not configured for restores
    #[error("Restore init container ({0}) not found")]
    RestoreContainerNotFound(String),

    /// The referenced backup has no captured datacenter definition
    #[error("Backup {0} has no datacenter snapshot")]
    SnapshotMissing(String),

    /// Backup agent RPC error
    #[error("Agent RPC error: {0}")]
    Agent(#[from] tonic::Status),

    /// Backup agent connection error
    #[error("Agent connection error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a not found error for the given kind
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Whether this error is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict(_) => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 409,
            _ => false,
        }
    }

    /// Whether this error means the object is gone
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// Whether retrying without a spec or template change can succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::RestoreContainerNotFound(_) | Error::Config(_) | Error::Serialization(_)
        )
    }
}

/// Map a 404 from the API server to `None`
pub(crate) fn optional<T>(result: std::result::Result<T, kube::Error>) -> Result<Option<T>> {
    match result {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Map a 409 from the API server to `Error::Conflict`
pub(crate) fn conflict_on<T>(
    result: std::result::Result<T, kube::Error>,
    what: impl Into<String>,
) -> Result<T> {
    match result {
        Ok(obj) => Ok(obj),
        Err(kube::Error::Api(resp)) if resp.code == 409 => Err(Error::Conflict(what.into())),
        Err(e) => Err(e.into()),
    }
}
