//! Operator configuration
//!
//! All settings come from environment variables with sensible defaults so the
//! operator runs unconfigured inside a cluster.

use std::time::Duration;

use crate::error::{Error, Result};

/// Default metrics port
pub const DEFAULT_METRICS_PORT: u16 = 8080;

/// Port the Medusa gRPC sidecar listens on
pub const DEFAULT_AGENT_PORT: u16 = 50051;

const DEFAULT_AGENT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_STALE_RUN_TIMEOUT_SECS: u64 = 6 * 60 * 60;
const DEFAULT_DELETION_RETRY_SECS: u64 = 30;

/// Runtime configuration for the operator
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Port for the metrics/health HTTP server
    pub metrics_port: u16,

    /// Port used to reach the agent on each node
    pub agent_port: u16,

    /// Connect timeout when dialing an agent
    pub agent_connect_timeout: Duration,

    /// Per-request deadline enforced by the agent transport (None = no deadline)
    pub agent_request_timeout: Option<Duration>,

    /// Age after which a backup run with nodes still in progress is considered
    /// stranded (None = never)
    pub stale_run_timeout: Option<Duration>,

    /// Pause before a backup deletion that failed on every node is retried
    pub deletion_retry_delay: Duration,

    /// Namespace to watch (None = all namespaces)
    pub watch_namespace: Option<String>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            metrics_port: DEFAULT_METRICS_PORT,
            agent_port: DEFAULT_AGENT_PORT,
            agent_connect_timeout: Duration::from_secs(DEFAULT_AGENT_CONNECT_TIMEOUT_SECS),
            agent_request_timeout: None,
            stale_run_timeout: Some(Duration::from_secs(DEFAULT_STALE_RUN_TIMEOUT_SECS)),
            deletion_retry_delay: Duration::from_secs(DEFAULT_DELETION_RETRY_SECS),
            watch_namespace: None,
        }
    }
}

impl OperatorConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let metrics_port = parse_or(&lookup, "METRICS_PORT", defaults.metrics_port)?;
        let agent_port = parse_or(&lookup, "AGENT_PORT", defaults.agent_port)?;
        let connect_secs = parse_or(
            &lookup,
            "AGENT_CONNECT_TIMEOUT_SECS",
            DEFAULT_AGENT_CONNECT_TIMEOUT_SECS,
        )?;
        let request_secs: u64 = parse_or(&lookup, "AGENT_REQUEST_TIMEOUT_SECS", 0)?;
        let stale_secs = parse_or(
            &lookup,
            "BACKUP_STALE_RUN_TIMEOUT_SECS",
            DEFAULT_STALE_RUN_TIMEOUT_SECS,
        )?;
        let deletion_retry_secs = parse_or(
            &lookup,
            "BACKUP_DELETION_RETRY_SECS",
            DEFAULT_DELETION_RETRY_SECS,
        )?;

        let watch_namespace = lookup("WATCH_NAMESPACE").filter(|ns| !ns.trim().is_empty());

        Ok(Self {
            metrics_port,
            agent_port,
            agent_connect_timeout: Duration::from_secs(connect_secs),
            agent_request_timeout: nonzero_secs(request_secs),
            stale_run_timeout: nonzero_secs(stale_secs),
            deletion_retry_delay: Duration::from_secs(deletion_retry_secs),
            watch_namespace,
        })
    }
}

fn nonzero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::config(format!("Invalid value '{}' for {}: {}", raw, key, e))),
    }
}
