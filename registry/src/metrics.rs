// Copyright (c) 2026 Volkov Pavel | DevITWay
// SPDX-License-Identifier: MIT

use axum::{
    body::Body,
    extract::MatchedPath,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec, IntCounterVec,
    TextEncoder,
};
use std::sync::Arc;
use std::time::Instant;

use crate::AppState;

lazy_static! {
    /// Total HTTP requests counter
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "portcullis_http_requests_total",
        "Total number of HTTP requests",
        &["surface", "method", "status"]
    ).expect("metric can be created");

    /// HTTP request duration histogram
    pub static ref HTTP_REQUEST_DURATION: HistogramVec = register_histogram_vec!(
        "portcullis_http_request_duration_seconds",
        "HTTP request latency in seconds",
        &["surface", "method"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).expect("metric can be created");

    /// Inbound manifest cache requests, keyed per upstream host.
    pub static ref MANIFEST_CACHE_REQUESTS: IntCounterVec = register_int_counter_vec!(
        "portcullis_inbound_manifest_cache_requests_total",
        "Inbound manifest cache lookups per upstream host",
        &["upstream_host", "result"]
    ).expect("metric can be created");

    /// Storage operations counter
    pub static ref STORAGE_OPERATIONS: IntCounterVec = register_int_counter_vec!(
        "portcullis_storage_operations_total",
        "Total storage operations",
        &["operation", "status"]
    ).expect("metric can be created");

    /// Blob replication bytes pushed into storage.
    pub static ref BLOB_REPLICATION_BYTES: IntCounterVec = register_int_counter_vec!(
        "portcullis_blob_replication_bytes_total",
        "Total bytes written while replicating blobs",
        &["account"]
    ).expect("metric can be created");

    /// Blob uploads aborted mid-stream.
    pub static ref BLOB_UPLOADS_ABORTED: IntCounterVec = register_int_counter_vec!(
        "portcullis_blob_uploads_aborted_total",
        "Blob uploads aborted due to storage or upstream error",
        &["account"]
    ).expect("metric can be created");

    /// Manifest ingestion quota denials.
    pub static ref INGESTION_QUOTA_DENIALS: IntCounterVec = register_int_counter_vec!(
        "portcullis_ingestion_quota_denials_total",
        "Manifest pushes rejected for exceeding the tenant quota",
        &["auth_tenant_id"]
    ).expect("metric can be created");
}

/// Routes for metrics endpoint
pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/metrics", get(metrics_handler))
}

/// Handler for /metrics endpoint
async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder
        .encode(&metric_families, &mut buffer)
        .unwrap_or_default();

    ([("content-type", "text/plain; charset=utf-8")], buffer)
}

/// Middleware to record request metrics
pub async fn metrics_middleware(
    matched_path: Option<MatchedPath>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let path = matched_path
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    // Determine API surface from path
    let surface = detect_surface(&path);

    // Process request
    let response = next.run(request).await;

    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    // Record metrics
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[&surface, &method, &status])
        .inc();

    HTTP_REQUEST_DURATION
        .with_label_values(&[&surface, &method])
        .observe(duration);

    response
}

/// Detect which API surface a path belongs to, for metric labeling.
fn detect_surface(path: &str) -> String {
    if path.starts_with("/v2") {
        "registry".to_string()
    } else if path.starts_with("/keppel/v1/auth") {
        "auth".to_string()
    } else if path.starts_with("/peer/v1") {
        "peer".to_string()
    } else {
        "other".to_string()
    }
}

/// Record an inbound manifest cache lookup.
#[allow(dead_code)]
pub fn record_manifest_cache(upstream_host: &str, hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    MANIFEST_CACHE_REQUESTS.with_label_values(&[upstream_host, result]).inc();
}

/// Record storage operation
#[allow(dead_code)]
pub fn record_storage_op(operation: &str, success: bool) {
    let status = if success { "success" } else { "error" };
    STORAGE_OPERATIONS
        .with_label_values(&[operation, status])
        .inc();
}

/// Record bytes written while replicating a blob.
#[allow(dead_code)]
pub fn record_blob_replication_bytes(account: &str, bytes: u64) {
    BLOB_REPLICATION_BYTES.with_label_values(&[account]).inc_by(bytes);
}

/// Record a blob upload aborted mid-stream.
#[allow(dead_code)]
pub fn record_blob_upload_aborted(account: &str) {
    BLOB_UPLOADS_ABORTED.with_label_values(&[account]).inc();
}

/// Record a manifest push rejected for exceeding quota.
#[allow(dead_code)]
pub fn record_ingestion_quota_denial(auth_tenant_id: &str) {
    INGESTION_QUOTA_DENIALS.with_label_values(&[auth_tenant_id]).inc();
}
