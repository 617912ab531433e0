//! Round-robin load balancing strategy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::load_balancer::{backend::Backend, pool::BackendPool, LoadBalancer};

/// Round-robin selector.
/// Stores a monotonically increasing cursor; the pick is `cursor mod healthy_count`.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn next_server(&self, pool: &BackendPool, _client_key: Option<&str>) -> Option<Arc<Backend>> {
        let healthy = pool.healthy();
        if healthy.is_empty() {
            return None;
        }

        let index = self.counter.fetch_add(1, Ordering::Relaxed) % healthy.len();
        Some(Arc::clone(&healthy[index]))
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}
