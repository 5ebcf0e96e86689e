//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gateway_requests_total` (counter): requests by outcome, status
//! - `gateway_request_duration_seconds` (histogram): time to response headers
//! - `gateway_rate_limited_total` (counter): admissions refused
//! - `gateway_moderation_total` (counter): flagged messages by action
//! - `gateway_sanitized_messages_total` (counter): messages rewritten
//! - `gateway_upstream_errors_total` (counter): classified upstream failures by kind
//! - `gateway_policy_reloads_total` (counter): policy reloads by result
//! - `gateway_tracked_clients` (gauge): identities held by the rate limiter
//!
//! Recording is a no-op until a recorder is installed, so library code and
//! tests can call these freely.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

/// Record a finished request. `outcome` is a stable label such as
/// `ok`, `rate_limited`, `invalid`, `blocked` or an upstream error kind.
pub fn record_request(outcome: &'static str, status: u16, start: Instant) {
    counter!(
        "gateway_requests_total",
        "outcome" => outcome,
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("gateway_request_duration_seconds", "outcome" => outcome)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_rate_limited() {
    counter!("gateway_rate_limited_total").increment(1);
}

pub fn record_moderation(action: &'static str) {
    counter!("gateway_moderation_total", "action" => action).increment(1);
}

pub fn record_sanitized(count: usize) {
    counter!("gateway_sanitized_messages_total").increment(count as u64);
}

pub fn record_upstream_error(kind: &'static str) {
    counter!("gateway_upstream_errors_total", "kind" => kind).increment(1);
}

pub fn record_policy_reload(success: bool) {
    let result = if success { "ok" } else { "error" };
    counter!("gateway_policy_reloads_total", "result" => result).increment(1);
}

pub fn record_tracked_clients(count: usize) {
    gauge!("gateway_tracked_clients").set(count as f64);
}
