//! Metrics collection and exposition.
//!
//! # Metrics
//! - `lb_requests_total` (counter): requests by method, status, backend
//! - `lb_request_duration_seconds` (histogram): latency distribution
//! - `lb_backend_health` (gauge): 1=healthy, 0=unhealthy
//! - `lb_rate_limited_total` (counter): rejected requests by limiter
//! - `lb_circuit_state` (gauge): 0=closed, 1=open, 2=half-open
//! - `lb_tcp_connections_total` (counter): TCP connections by outcome
//! - `lb_tcp_bytes_total` (counter): TCP bytes by direction
//!
//! Recording goes through the `metrics` facade and is a no-op until an
//! exporter is installed.

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use std::time::Instant;

use crate::resilience::circuit_breaker::CircuitState;

const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Install the Prometheus recorder and its scrape endpoint on `addr`.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            Matcher::Full("lb_request_duration_seconds".to_string()),
            LATENCY_BUCKETS,
        )?
        .install()?;

    tracing::info!(address = %addr, "Prometheus metrics endpoint listening");
    Ok(())
}

/// Record a completed HTTP request.
pub fn record_request(method: &str, status: u16, backend: &str, start: Instant) {
    let labels = [
        ("method", method.to_string()),
        ("status", status.to_string()),
        ("backend", backend.to_string()),
    ];
    metrics::counter!("lb_requests_total", &labels).increment(1);
    metrics::histogram!("lb_request_duration_seconds", &labels).record(start.elapsed().as_secs_f64());
}

pub fn record_backend_health(backend: &str, healthy: bool) {
    metrics::gauge!("lb_backend_health", "backend" => backend.to_string())
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_rate_limited(limiter: &str) {
    metrics::counter!("lb_rate_limited_total", "limiter" => limiter.to_string()).increment(1);
}

pub fn record_circuit_state(breaker: &str, state: CircuitState) {
    let value = match state {
        CircuitState::Closed => 0.0,
        CircuitState::Open => 1.0,
        CircuitState::HalfOpen => 2.0,
    };
    metrics::gauge!("lb_circuit_state", "breaker" => breaker.to_string()).set(value);
}

/// Count a TCP connection by outcome (`accepted`, `rejected`, `failed`).
pub fn record_tcp_connection(outcome: &'static str) {
    metrics::counter!("lb_tcp_connections_total", "outcome" => outcome).increment(1);
}

pub fn record_tcp_bytes(direction: &'static str, bytes: u64) {
    metrics::counter!("lb_tcp_bytes_total", "direction" => direction).increment(bytes);
}
