//! Prometheus metrics exposition
//!
//! - `proxy_requests_total` (counter): labels `status`, `method`, `route`
//! - `proxy_request_duration_seconds` (histogram): label `status`
//! - `proxy_upstream_errors_total` (counter): label `error_type`
//! - `proxy_stream_disconnects_total` (counter)
//! - `key_pool_eligible_keys` (gauge), refreshed on every scrape
//!
//! `key_pool_penalties_total` and `key_pool_waits_total` are emitted by the
//! key pool itself.

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

/// Bucket boundaries from 5ms to 5min; streamed completions run long.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("proxy_request_duration_seconds".to_string()),
        DURATION_BUCKETS,
    )
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// Configures `proxy_request_duration_seconds` with histogram buckets so it
/// renders as a Prometheus histogram (with `_bucket` lines for
/// `histogram_quantile()` queries) rather than the default summary.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record a completed proxy request.
pub fn record_request(status: u16, method: &str, route: &str, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!(
        "proxy_requests_total",
        "status" => status_str.clone(),
        "method" => method.to_string(),
        "route" => route.to_string()
    )
    .increment(1);
    metrics::histogram!("proxy_request_duration_seconds", "status" => status_str)
        .record(duration_secs);
}

/// Record an upstream error with a classification label.
pub fn record_upstream_error(error_type: &str) {
    metrics::counter!("proxy_upstream_errors_total", "error_type" => error_type.to_string())
        .increment(1);
}

/// Record a client that went away before its stream finished.
pub fn record_stream_disconnect() {
    metrics::counter!("proxy_stream_disconnects_total").increment(1);
}

pub fn set_eligible_keys(count: usize) {
    metrics::gauge!("key_pool_eligible_keys").set(count as f64);
}
