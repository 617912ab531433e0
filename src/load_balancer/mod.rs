//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Route matched → backend_group identified
//!     → pool.rs (healthy members of the group)
//!     → Apply the group's selection strategy:
//!         - round_robin.rs (rotate through backends)
//!         - weighted.rs (smooth weighted round robin)
//!         - hashing.rs (ip hash, consistent hash ring)
//!         - least_conn.rs (fewest connections, optionally per weight)
//!         - fastest.rs (connections + moving average response time)
//!     → backend.rs (connection guard, request statistics)
//! ```
//!
//! # Design Decisions
//! - Strategies only ever return healthy backends
//! - Per-backend counters are atomics; pool membership is behind a RwLock
//! - Algorithm selection per backend group, overridable per route

pub mod backend;
pub mod fastest;
pub mod hashing;
pub mod least_conn;
pub mod pool;
pub mod round_robin;
pub mod weighted;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::BalancerConfig;
use backend::{Backend, BackendSnapshot};
use pool::BackendPool;

pub use backend::BackendConnectionGuard;
pub use hashing::HashFunction;

/// Errors raised while building backends and strategies.
#[derive(Debug, thiserror::Error)]
pub enum BalancerError {
    #[error("unknown algorithm '{name}', expected one of: {}", Algorithm::names().join(", "))]
    UnknownAlgorithm { name: String },

    #[error("backend '{backend}' has invalid weight {weight}, weights must be >= 1")]
    InvalidWeight { backend: String, weight: u32 },

    #[error("invalid backend address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("invalid {algorithm} parameter: {reason}")]
    InvalidParameter {
        algorithm: &'static str,
        reason: String,
    },
}

/// Selection strategy over a backend pool.
///
/// Implementations only consider healthy backends and return `None` when no
/// healthy backend exists.
pub trait LoadBalancer: Send + Sync + fmt::Debug {
    /// Select the next backend. `client_key` is usually the client IP.
    fn next_server(&self, pool: &BackendPool, client_key: Option<&str>) -> Option<Arc<Backend>>;

    /// Strategy name, matching its [`Algorithm`] spelling.
    fn name(&self) -> &'static str;

    /// Feed an observed response time back into the strategy.
    fn observe_response_time(&self, _backend: &Backend, _elapsed: Duration) {}
}

/// Available selection algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    RoundRobin,
    WeightedRoundRobin,
    SmoothWeightedRoundRobin,
    IpHash,
    ConsistentHash,
    LeastConnections,
    WeightedLeastConnections,
    FastestResponse,
}

impl Algorithm {
    pub const ALL: [Algorithm; 8] = [
        Algorithm::RoundRobin,
        Algorithm::WeightedRoundRobin,
        Algorithm::SmoothWeightedRoundRobin,
        Algorithm::IpHash,
        Algorithm::ConsistentHash,
        Algorithm::LeastConnections,
        Algorithm::WeightedLeastConnections,
        Algorithm::FastestResponse,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::RoundRobin => "round_robin",
            Algorithm::WeightedRoundRobin => "weighted_round_robin",
            Algorithm::SmoothWeightedRoundRobin => "smooth_weighted_round_robin",
            Algorithm::IpHash => "ip_hash",
            Algorithm::ConsistentHash => "consistent_hash",
            Algorithm::LeastConnections => "least_connections",
            Algorithm::WeightedLeastConnections => "weighted_least_connections",
            Algorithm::FastestResponse => "fastest_response",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Algorithm::RoundRobin => "Rotate through healthy backends in order",
            Algorithm::WeightedRoundRobin | Algorithm::SmoothWeightedRoundRobin => {
                "Interleave backends in proportion to their weight"
            }
            Algorithm::IpHash => "Pin each client address to a backend by hash",
            Algorithm::ConsistentHash => "Hash ring with virtual nodes, minimal remapping",
            Algorithm::LeastConnections => "Pick the backend with the fewest active connections",
            Algorithm::WeightedLeastConnections => "Fewest active connections relative to weight",
            Algorithm::FastestResponse => "Blend of connection load and recent response time",
        }
    }

    pub fn names() -> Vec<&'static str> {
        Self::ALL.iter().map(Algorithm::as_str).collect()
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = BalancerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == normalized)
            .ok_or_else(|| BalancerError::UnknownAlgorithm { name: s.to_string() })
    }
}

/// Build a strategy for `algorithm` using the tuning knobs in `config`.
pub fn build_strategy(
    algorithm: Algorithm,
    config: &BalancerConfig,
) -> Result<Box<dyn LoadBalancer>, BalancerError> {
    let strategy: Box<dyn LoadBalancer> = match algorithm {
        Algorithm::RoundRobin => Box::new(round_robin::RoundRobin::new()),
        Algorithm::WeightedRoundRobin => Box::new(weighted::WeightedRoundRobin::new()),
        Algorithm::SmoothWeightedRoundRobin => Box::new(weighted::WeightedRoundRobin::smooth()),
        Algorithm::IpHash => Box::new(hashing::IpHash::new(config.hash_function)),
        Algorithm::ConsistentHash => Box::new(hashing::ConsistentHash::new(
            config.virtual_nodes,
            config.hash_function,
        )?),
        Algorithm::LeastConnections => Box::new(least_conn::LeastConnections::new()),
        Algorithm::WeightedLeastConnections => {
            Box::new(least_conn::WeightedLeastConnections::new())
        }
        Algorithm::FastestResponse => Box::new(fastest::FastestResponse::new(
            config.connection_weight,
            config.response_time_weight,
        )?),
    };
    Ok(strategy)
}

/// A backend pool paired with the strategy that selects from it.
#[derive(Debug)]
pub struct Balancer {
    pool: Arc<BackendPool>,
    strategy: Box<dyn LoadBalancer>,
}

impl Balancer {
    pub fn new(pool: Arc<BackendPool>, strategy: Box<dyn LoadBalancer>) -> Self {
        Self { pool, strategy }
    }

    pub fn from_config(
        pool: Arc<BackendPool>,
        algorithm: Algorithm,
        config: &BalancerConfig,
    ) -> Result<Self, BalancerError> {
        Ok(Self::new(pool, build_strategy(algorithm, config)?))
    }

    /// Select the next healthy backend, or `None` if none is available.
    pub fn next_backend(&self, client_key: Option<&str>) -> Option<Arc<Backend>> {
        let selected = self.strategy.next_server(&self.pool, client_key);
        if selected.is_none() {
            tracing::debug!(
                algorithm = self.strategy.name(),
                backends = self.pool.len(),
                "No healthy backend available"
            );
        }
        selected
    }

    /// Record the outcome of one forwarded request.
    pub fn record_response(&self, backend: &Backend, elapsed: Duration, success: bool) {
        backend.record_request(elapsed);
        if success {
            self.strategy.observe_response_time(backend, elapsed);
        } else {
            backend.mark_error();
        }
    }

    pub fn pool(&self) -> &Arc<BackendPool> {
        &self.pool
    }

    pub fn algorithm(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn stats(&self) -> BalancerStats {
        let backends: Vec<BackendSnapshot> = self.pool.all().iter().map(|b| b.snapshot()).collect();
        let healthy = backends.iter().filter(|b| b.healthy).count();
        let total_requests: u64 = backends.iter().map(|b| b.total_requests).sum();
        let total_errors: u64 = backends.iter().map(|b| b.error_count).sum();
        let weighted_time: f64 = backends
            .iter()
            .map(|b| b.average_response_time_ms * b.total_requests as f64)
            .sum();

        BalancerStats {
            algorithm: self.algorithm(),
            total_backends: backends.len(),
            healthy_backends: healthy,
            unhealthy_backends: backends.len() - healthy,
            total_requests,
            total_errors,
            error_rate: if total_requests > 0 {
                total_errors as f64 / total_requests as f64
            } else {
                0.0
            },
            average_response_time_ms: if total_requests > 0 {
                weighted_time / total_requests as f64
            } else {
                0.0
            },
            backends,
        }
    }
}

/// Aggregate view over a balancer's pool.
#[derive(Debug, Clone, Serialize)]
pub struct BalancerStats {
    pub algorithm: &'static str,
    pub total_backends: usize,
    pub healthy_backends: usize,
    pub unhealthy_backends: usize,
    pub total_requests: u64,
    pub total_errors: u64,
    pub error_rate: f64,
    pub average_response_time_ms: f64,
    pub backends: Vec<BackendSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn algorithm_from_str() {
        assert_eq!("round_robin".parse::<Algorithm>().unwrap(), Algorithm::RoundRobin);
        assert_eq!("Least-Connections".parse::<Algorithm>().unwrap(), Algorithm::LeastConnections);
        let err = "random".parse::<Algorithm>().unwrap_err();
        assert!(err.to_string().contains("consistent_hash"));
    }

    #[test]
    fn every_algorithm_builds() {
        let config = BalancerConfig::default();
        for algorithm in Algorithm::ALL {
            let strategy = build_strategy(algorithm, &config).unwrap();
            assert_eq!(strategy.name(), algorithm.as_str());
        }
    }

    #[test]
    fn balancer_stats_aggregate() {
        let pool = Arc::new(BackendPool::with_backends([
            Backend::new("b1", "127.0.0.1", 8001, 1).unwrap(),
            Backend::new("b2", "127.0.0.1", 8002, 1).unwrap(),
        ]));
        let balancer = Balancer::from_config(pool, Algorithm::RoundRobin, &BalancerConfig::default()).unwrap();

        let b = balancer.next_backend(None).unwrap();
        balancer.record_response(&b, Duration::from_millis(10), true);
        balancer.record_response(&b, Duration::from_millis(30), false);
        balancer.pool().set_health("b2", false);

        let stats = balancer.stats();
        assert_eq!(stats.algorithm, "round_robin");
        assert_eq!(stats.healthy_backends, 1);
        assert_eq!(stats.unhealthy_backends, 1);
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.total_errors, 1);
        assert!((stats.error_rate - 0.5).abs() < 1e-9);
        assert!((stats.average_response_time_ms - 20.0).abs() < 1e-9);
    }
}
