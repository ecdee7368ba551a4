//! Prometheus metrics for the Cassandra Backup Operator
//!
//! Covers reconcile activity, backup run and per-node outcomes, remote
//! deletions and restores, plus the `/metrics`, `/healthz` and `/readyz`
//! endpoints.

mod prometheus;

pub use prometheus::*;
