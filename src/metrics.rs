//! Prometheus metrics for the block server.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, provides an axum middleware for HTTP RED
//! metrics, and exposes the `/metrics` endpoint handler.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "blockserver_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "blockserver_http_request_duration_seconds";

/// Total key-value operations (counter). Labels: operation, outcome.
pub const KV_OPERATIONS_TOTAL: &str = "blockserver_kv_operations_total";

/// Elections started by this node (counter).
pub const ELECTIONS_TOTAL: &str = "blockserver_elections_total";

/// Elections won by this node (counter).
pub const LEADER_ELECTED_TOTAL: &str = "blockserver_leader_elected_total";

/// Current term (gauge).
pub const CURRENT_TERM: &str = "blockserver_current_term";

/// Commit index (gauge).
pub const COMMIT_INDEX: &str = "blockserver_commit_index";

/// Failed or timed-out peer RPCs (counter). Labels: rpc.
pub const PEER_RPC_FAILURES_TOTAL: &str = "blockserver_peer_rpc_failures_total";

// -- Global recorder installation ---------------------------------------------

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static INSTALL_LOCK: Mutex<()> = Mutex::new(());

/// Install the global Prometheus recorder. Idempotent, so tests may call it
/// repeatedly.
pub fn init_metrics() -> anyhow::Result<&'static PrometheusHandle> {
    let _guard = INSTALL_LOCK
        .lock()
        .map_err(|_| anyhow::anyhow!("metrics install lock poisoned"))?;
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle);
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle))
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(KV_OPERATIONS_TOTAL, "Key-value operations by outcome");
    describe_counter!(ELECTIONS_TOTAL, "Elections started by this node");
    describe_counter!(LEADER_ELECTED_TOTAL, "Elections won by this node");
    describe_gauge!(CURRENT_TERM, "Current consensus term");
    describe_gauge!(COMMIT_INDEX, "Number of committed log entries");
    describe_counter!(PEER_RPC_FAILURES_TOTAL, "Failed or timed-out peer RPCs");
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware that records HTTP RED metrics for every request.
///
/// Skips `/metrics` itself. Must be the outermost layer.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }

    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path, "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

/// Map a request path to a bounded label set.
fn normalize_path(path: &str) -> &'static str {
    match path {
        "/request" => "/request",
        "/vote_req" => "/vote_req",
        "/heartbeat" => "/heartbeat",
        "/health" => "/health",
        _ => "/other",
    }
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- Render Prometheus exposition format text.
pub async fn metrics_handler() -> Response {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}
