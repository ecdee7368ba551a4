//! Cassandra Backup Kubernetes Operator
//!
//! Backs up and restores Cassandra datacenters managed by cass-operator,
//! driven by `CassandraBackup` and `CassandraRestore` custom resources and
//! executed by the Medusa agent running beside every Cassandra node.

pub mod adapters;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod metrics;
pub mod reconcilers;
pub mod retry;

pub use config::OperatorConfig;
pub use error::{Error, Result};
