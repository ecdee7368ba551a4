//! Prometheus metrics definitions and HTTP server

use std::net::SocketAddr;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};
use tokio::net::TcpListener;
use tracing::{error, info};

/// Outcome label values
pub const OUTCOME_SUCCEEDED: &str = "succeeded";
pub const OUTCOME_FAILED: &str = "failed";

lazy_static::lazy_static! {
    /// Total number of reconciliations
    pub static ref RECONCILIATIONS: CounterVec = register_counter_vec!(
        "cassandra_backup_operator_reconciliations_total",
        "Total number of reconciliations",
        &["kind"]
    ).unwrap();

    /// Total number of reconciliation errors
    pub static ref RECONCILIATION_ERRORS: CounterVec = register_counter_vec!(
        "cassandra_backup_operator_reconciliation_errors_total",
        "Total number of reconciliation errors",
        &["kind"]
    ).unwrap();

    /// Reconciliation duration histogram
    pub static ref RECONCILE_DURATION: HistogramVec = register_histogram_vec!(
        "cassandra_backup_operator_reconcile_duration_seconds",
        "Duration of reconciliations in seconds",
        &["kind"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 60.0, 300.0]
    ).unwrap();

    /// Completed backup runs; failed means at least one node failed
    pub static ref BACKUPS_TOTAL: CounterVec = register_counter_vec!(
        "cassandra_backup_operator_backups_total",
        "Total number of backup runs by outcome",
        &["outcome", "namespace", "name"]
    ).unwrap();

    /// Per-node backup calls
    pub static ref NODE_BACKUPS_TOTAL: CounterVec = register_counter_vec!(
        "cassandra_backup_operator_node_backups_total",
        "Total number of per-node backup calls by outcome",
        &["outcome", "namespace"]
    ).unwrap();

    /// Backup run duration histogram
    pub static ref BACKUP_DURATION: HistogramVec = register_histogram_vec!(
        "cassandra_backup_operator_backup_duration_seconds",
        "Duration of backup runs",
        &["namespace", "name"],
        vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0, 14400.0]
    ).unwrap();

    /// Remote backup deletions
    pub static ref BACKUP_DELETIONS_TOTAL: CounterVec = register_counter_vec!(
        "cassandra_backup_operator_backup_deletions_total",
        "Total number of remote backup deletions by outcome",
        &["outcome", "namespace"]
    ).unwrap();

    /// Total number of restores
    pub static ref RESTORES_TOTAL: CounterVec = register_counter_vec!(
        "cassandra_backup_operator_restores_total",
        "Total number of restores by outcome",
        &["outcome", "namespace", "name"]
    ).unwrap();

    /// Restore duration histogram, from start to fresh ready
    pub static ref RESTORE_DURATION: HistogramVec = register_histogram_vec!(
        "cassandra_backup_operator_restore_duration_seconds",
        "Duration of restore operations",
        &["namespace", "name"],
        vec![5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0]
    ).unwrap();

    /// Operator health (1 = healthy, 0 = unhealthy)
    pub static ref OPERATOR_HEALTH: Gauge = register_gauge!(
        "cassandra_backup_operator_health",
        "Operator health status (1 = healthy, 0 = unhealthy)"
    ).unwrap();
}

/// Label value for a success flag
pub fn outcome(succeeded: bool) -> &'static str {
    if succeeded {
        OUTCOME_SUCCEEDED
    } else {
        OUTCOME_FAILED
    }
}

/// Start the metrics HTTP server
pub async fn serve(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    OPERATOR_HEALTH.set(1.0);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!("Error serving connection: {}", e);
            }
        });
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    Ok(route(req.uri().path()))
}

fn route(path: &str) -> Response<Full<Bytes>> {
    match path {
        "/metrics" => metrics_response(),
        "/healthz" | "/readyz" => text_response(StatusCode::OK, "ok"),
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    }
}

fn metrics_response() -> Response<Full<Bytes>> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics");
    }

    let mut response = Response::new(Full::new(Bytes::from(buffer)));
    if let Ok(content_type) = encoder.format_type().parse() {
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, content_type);
    }
    response
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}
