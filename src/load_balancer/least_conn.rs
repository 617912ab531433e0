//! Least Connections load balancing strategies.

use std::sync::Arc;

use crate::load_balancer::{backend::Backend, pool::BackendPool, LoadBalancer};

/// Least connections selector.
/// Selects the healthy backend with the minimum number of active connections.
#[derive(Debug, Default)]
pub struct LeastConnections;

impl LeastConnections {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for LeastConnections {
    fn next_server(&self, pool: &BackendPool, _client_key: Option<&str>) -> Option<Arc<Backend>> {
        // min_by_key keeps the first of equal minima
        pool.healthy()
            .into_iter()
            .min_by_key(|b| b.active_connections())
    }

    fn name(&self) -> &'static str {
        "least_connections"
    }
}

/// Weighted least connections: minimizes `active / max(weight, 1)`.
#[derive(Debug, Default)]
pub struct WeightedLeastConnections;

impl WeightedLeastConnections {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for WeightedLeastConnections {
    fn next_server(&self, pool: &BackendPool, _client_key: Option<&str>) -> Option<Arc<Backend>> {
        let mut best: Option<(f64, Arc<Backend>)> = None;
        for backend in pool.healthy() {
            let ratio = backend.active_connections() as f64 / f64::from(backend.weight.max(1));
            if best.as_ref().map_or(true, |(min, _)| ratio < *min) {
                best = Some((ratio, backend));
            }
        }
        best.map(|(_, backend)| backend)
    }

    fn name(&self) -> &'static str {
        "weighted_least_connections"
    }
}
