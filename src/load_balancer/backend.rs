//! Backend abstraction.
//!
//! # Responsibilities
//! - Represent a single backend server (id, address, static weight)
//! - Track active connections (for the least-connections family)
//! - Track health and cumulative request statistics
//!
//! Counters are plain atomics so selection never needs the pool lock.

use serde::Serialize;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::load_balancer::BalancerError;

/// A single backend server.
#[derive(Debug)]
pub struct Backend {
    /// Unique backend identifier.
    pub id: String,
    pub host: String,
    pub port: u16,
    /// Static weight used by the weighted strategies. Always >= 1.
    pub weight: u32,
    /// Pre-calculated base URL for forwarding.
    pub base_url: Url,

    active_connections: AtomicUsize,
    healthy: AtomicBool,
    total_requests: AtomicU64,
    /// Sum of observed response times in microseconds.
    total_response_time_us: AtomicU64,
    error_count: AtomicU64,
}

impl Backend {
    /// Create a new backend. New backends start healthy.
    pub fn new(
        id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        weight: u32,
    ) -> Result<Self, BalancerError> {
        let id = id.into();
        let host = host.into();

        if weight == 0 {
            return Err(BalancerError::InvalidWeight { backend: id, weight });
        }

        let base_url = Url::parse(&format!("http://{}:{}", host, port)).map_err(|e| {
            BalancerError::InvalidAddress {
                address: format!("{}:{}", host, port),
                reason: e.to_string(),
            }
        })?;

        Ok(Self {
            id,
            host,
            port,
            weight,
            base_url,
            active_connections: AtomicUsize::new(0),
            healthy: AtomicBool::new(true),
            total_requests: AtomicU64::new(0),
            total_response_time_us: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
        })
    }

    /// `host:port`, used both for dialing and as the consistent-hash key.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn increment_active(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement active connections. A decrement at zero is a no-op.
    pub fn decrement_active(&self) {
        let _ = self.active_connections.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
            n.checked_sub(1)
        });
    }

    /// Increment active connections and return a guard that undoes it on drop.
    pub fn connection_guard(self: &Arc<Self>) -> BackendConnectionGuard {
        self.increment_active();
        BackendConnectionGuard {
            backend: Arc::clone(self),
        }
    }

    // --- Health ---

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Set the health flag. Returns the previous value.
    pub fn set_healthy(&self, healthy: bool) -> bool {
        self.healthy.swap(healthy, Ordering::Relaxed)
    }

    // --- Statistics ---

    /// Record one completed request and its response time.
    pub fn record_request(&self, elapsed: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.total_response_time_us.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn mark_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    /// Mean response time in milliseconds, 0.0 before the first request.
    pub fn average_response_time_ms(&self) -> f64 {
        let requests = self.total_requests();
        if requests == 0 {
            return 0.0;
        }
        let total_us = self.total_response_time_us.load(Ordering::Relaxed) as f64;
        total_us / requests as f64 / 1000.0
    }

    /// Serializable view of the live counters.
    pub fn snapshot(&self) -> BackendSnapshot {
        BackendSnapshot {
            id: self.id.clone(),
            address: self.address(),
            weight: self.weight,
            healthy: self.is_healthy(),
            active_connections: self.active_connections(),
            total_requests: self.total_requests(),
            error_count: self.error_count(),
            average_response_time_ms: self.average_response_time_ms(),
        }
    }
}

/// Point-in-time copy of a backend's state.
#[derive(Debug, Clone, Serialize)]
pub struct BackendSnapshot {
    pub id: String,
    pub address: String,
    pub weight: u32,
    pub healthy: bool,
    pub active_connections: usize,
    pub total_requests: u64,
    pub error_count: u64,
    pub average_response_time_ms: f64,
}

/// A RAII guard that manages the active connection count.
#[derive(Debug)]
pub struct BackendConnectionGuard {
    backend: Arc<Backend>,
}

impl BackendConnectionGuard {
    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }
}

impl Deref for BackendConnectionGuard {
    type Target = Backend;
    fn deref(&self) -> &Self::Target {
        &self.backend
    }
}

impl Drop for BackendConnectionGuard {
    fn drop(&mut self) {
        self.backend.decrement_active();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_weight() {
        let err = Backend::new("b1", "127.0.0.1", 8080, 0).unwrap_err();
        assert!(matches!(err, BalancerError::InvalidWeight { weight: 0, .. }));
    }

    #[test]
    fn decrement_at_zero_is_noop() {
        let b = Backend::new("b1", "127.0.0.1", 8080, 1).unwrap();
        b.decrement_active();
        assert_eq!(b.active_connections(), 0);
        b.increment_active();
        b.decrement_active();
        b.decrement_active();
        assert_eq!(b.active_connections(), 0);
    }

    #[test]
    fn guard_releases_on_drop() {
        let b = Arc::new(Backend::new("b1", "127.0.0.1", 8080, 1).unwrap());
        let g1 = b.connection_guard();
        let g2 = b.connection_guard();
        assert_eq!(b.active_connections(), 2);
        drop(g1);
        assert_eq!(b.active_connections(), 1);
        drop(g2);
        assert_eq!(b.active_connections(), 0);
    }

    #[test]
    fn average_response_time() {
        let b = Backend::new("b1", "localhost", 9000, 3).unwrap();
        assert_eq!(b.average_response_time_ms(), 0.0);
        b.record_request(Duration::from_millis(10));
        b.record_request(Duration::from_millis(30));
        assert!((b.average_response_time_ms() - 20.0).abs() < f64::EPSILON);
        assert_eq!(b.address(), "localhost:9000");
        assert_eq!(b.snapshot().total_requests, 2);
    }
}
