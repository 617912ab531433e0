//! Smooth weighted round-robin.
//!
//! Each pick adds every healthy backend's static weight to its current weight,
//! selects the largest current weight (first on ties) and subtracts the total
//! weight from the winner. Over `total_weight` picks every backend is chosen
//! exactly `weight` times, interleaved rather than bursty.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use crate::load_balancer::{backend::Backend, pool::BackendPool, LoadBalancer};

#[derive(Debug)]
pub struct WeightedRoundRobin {
    name: &'static str,
    /// Current weight per backend id.
    current: Mutex<HashMap<String, i64>>,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self::named("weighted_round_robin")
    }

    /// Same algorithm, registered under the `smooth_weighted_round_robin` name.
    pub fn smooth() -> Self {
        Self::named("smooth_weighted_round_robin")
    }

    fn named(name: &'static str) -> Self {
        Self {
            name,
            current: Mutex::new(HashMap::new()),
        }
    }

    /// Current weights, mostly for debugging.
    pub fn current_weights(&self) -> HashMap<String, i64> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Default for WeightedRoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for WeightedRoundRobin {
    fn next_server(&self, pool: &BackendPool, _client_key: Option<&str>) -> Option<Arc<Backend>> {
        let healthy = pool.healthy();
        if healthy.is_empty() {
            return None;
        }

        let total: i64 = healthy.iter().map(|b| i64::from(b.weight)).sum();
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);

        // Forget backends that left the healthy set so they rejoin from zero.
        let ids: HashSet<&str> = healthy.iter().map(|b| b.id.as_str()).collect();
        current.retain(|id, _| ids.contains(id.as_str()));

        let mut best: Option<(usize, i64)> = None;
        for (index, backend) in healthy.iter().enumerate() {
            let weight = current.entry(backend.id.clone()).or_insert(0);
            *weight += i64::from(backend.weight);
            if best.map_or(true, |(_, max)| *weight > max) {
                best = Some((index, *weight));
            }
        }

        let (index, _) = best?;
        let winner = &healthy[index];
        if let Some(weight) = current.get_mut(&winner.id) {
            *weight -= total;
        }
        Some(Arc::clone(winner))
    }

    fn name(&self) -> &'static str {
        self.name
    }
}
