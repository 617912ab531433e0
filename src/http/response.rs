//! Response handling and transformation.
//!
//! # Responsibilities
//! - Map proxy failures to HTTP status codes
//! - Rewrite backend response headers for the client
//! - Keep request outcome statistics
//!
//! # Design Decisions
//! - Streaming responses avoid buffering the entire body
//! - Backend timeouts result in 504 Gateway Timeout

use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use hyper::body::Incoming;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::security::headers;

/// Why a request was not served by a backend.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("no route matches '{path}'")]
    RouteNotFound { path: String },

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("service temporarily unavailable: circuit '{breaker}' is open")]
    CircuitOpen { breaker: String },

    #[error("no healthy backend available in group '{group}'")]
    NoHealthyBackend { group: String },

    #[error("backend {backend} unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    #[error("backend {backend} did not respond within {timeout:?}")]
    UpstreamTimeout { backend: String, timeout: Duration },

    #[error("upstream request to {backend} failed: {reason}")]
    Upstream { backend: String, reason: String },

    #[error("invalid upstream request: {reason}")]
    InvalidRequest { reason: String },
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            ProxyError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::CircuitOpen { .. }
            | ProxyError::NoHealthyBackend { .. }
            | ProxyError::BackendUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

/// Convert a backend response into the client response.
pub fn downstream_response(response: hyper::Response<Incoming>, backend_address: &str, enable_cors: bool) -> Response {
    let (mut parts, body) = response.into_parts();
    headers::prepare_downstream(&mut parts.headers, backend_address, enable_cors);
    Response::from_parts(parts, Body::new(body))
}

/// Request outcome counters.
#[derive(Debug, Default)]
pub struct ProxyStats {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    rate_limited: AtomicU64,
    total_response_time_us: AtomicU64,
}

impl ProxyStats {
    pub fn record_request(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self, elapsed: Duration) {
        self.successful.fetch_add(1, Ordering::Relaxed);
        self.total_response_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self, error: &ProxyError) {
        match error {
            ProxyError::RateLimited => self.rate_limited.fetch_add(1, Ordering::Relaxed),
            _ => self.failed.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn snapshot(&self) -> ProxyStatsSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        let successful = self.successful.load(Ordering::Relaxed);
        let time_us = self.total_response_time_us.load(Ordering::Relaxed);
        ProxyStatsSnapshot {
            total_requests: total,
            successful_requests: successful,
            failed_requests: self.failed.load(Ordering::Relaxed),
            rate_limited_requests: self.rate_limited.load(Ordering::Relaxed),
            success_rate: if total > 0 {
                successful as f64 / total as f64
            } else {
                0.0
            },
            average_response_time_ms: if successful > 0 {
                time_us as f64 / successful as f64 / 1000.0
            } else {
                0.0
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProxyStatsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rate_limited_requests: u64,
    pub success_rate: f64,
    pub average_response_time_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_status_codes() {
        assert_eq!(ProxyError::RateLimited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            ProxyError::CircuitOpen { breaker: "api".into() }.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyError::UpstreamTimeout {
                backend: "b1".into(),
                timeout: Duration::from_secs(1)
            }
            .status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ProxyError::RouteNotFound { path: "/x".into() }.into_response().status(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn stats_average_over_successes() {
        let stats = ProxyStats::default();
        for _ in 0..4 {
            stats.record_request();
        }
        stats.record_success(Duration::from_millis(10));
        stats.record_success(Duration::from_millis(30));
        stats.record_failure(&ProxyError::RateLimited);
        stats.record_failure(&ProxyError::NoHealthyBackend { group: "web".into() });

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.successful_requests, 2);
        assert_eq!(snapshot.failed_requests, 1);
        assert_eq!(snapshot.rate_limited_requests, 1);
        assert_eq!(snapshot.success_rate, 0.5);
        assert!((snapshot.average_response_time_ms - 20.0).abs() < 1e-9);
    }
}
