//! Fastest response strategy.
//!
//! Scores each healthy backend as
//! `connection_weight * active/max_active + response_time_weight * avg/max_avg`
//! and picks the lowest score. Response times are a moving average over the
//! last [`ResponseTimeTracker::MAX_SAMPLES`] observations.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::load_balancer::{backend::Backend, pool::BackendPool, BalancerError, LoadBalancer};

/// Bounded window of response time samples in milliseconds.
#[derive(Debug, Clone, Default)]
pub struct ResponseTimeTracker {
    samples: VecDeque<f64>,
}

impl ResponseTimeTracker {
    pub const MAX_SAMPLES: usize = 100;
    /// Average reported before any sample exists.
    pub const DEFAULT_AVERAGE_MS: f64 = 100.0;

    pub fn record(&mut self, elapsed_ms: f64) {
        if self.samples.len() == Self::MAX_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(elapsed_ms);
    }

    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return Self::DEFAULT_AVERAGE_MS;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    pub fn stats(&self) -> ResponseTimeStats {
        let min = self.samples.iter().copied().fold(f64::INFINITY, f64::min);
        let max = self.samples.iter().copied().fold(0.0, f64::max);
        ResponseTimeStats {
            average_ms: self.average(),
            min_ms: if self.samples.is_empty() { 0.0 } else { min },
            max_ms: max,
            count: self.samples.len(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResponseTimeStats {
    pub average_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub count: usize,
}

#[derive(Debug)]
pub struct FastestResponse {
    connection_weight: f64,
    response_time_weight: f64,
    trackers: Mutex<HashMap<String, ResponseTimeTracker>>,
}

impl FastestResponse {
    pub const DEFAULT_CONNECTION_WEIGHT: f64 = 0.6;
    pub const DEFAULT_RESPONSE_TIME_WEIGHT: f64 = 0.4;

    pub fn new(connection_weight: f64, response_time_weight: f64) -> Result<Self, BalancerError> {
        let valid = connection_weight.is_finite()
            && response_time_weight.is_finite()
            && connection_weight >= 0.0
            && response_time_weight >= 0.0
            && connection_weight + response_time_weight > 0.0;
        if !valid {
            return Err(BalancerError::InvalidParameter {
                algorithm: "fastest_response",
                reason: format!(
                    "weights must be non-negative with a positive sum, got {} and {}",
                    connection_weight, response_time_weight
                ),
            });
        }
        Ok(Self {
            connection_weight,
            response_time_weight,
            trackers: Mutex::new(HashMap::new()),
        })
    }

    pub fn response_time_stats(&self, backend_id: &str) -> Option<ResponseTimeStats> {
        self.trackers().get(backend_id).map(ResponseTimeTracker::stats)
    }

    /// Forget all samples.
    pub fn reset(&self) {
        self.trackers().clear();
    }

    fn trackers(&self) -> std::sync::MutexGuard<'_, HashMap<String, ResponseTimeTracker>> {
        self.trackers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for FastestResponse {
    fn default() -> Self {
        Self {
            connection_weight: Self::DEFAULT_CONNECTION_WEIGHT,
            response_time_weight: Self::DEFAULT_RESPONSE_TIME_WEIGHT,
            trackers: Mutex::new(HashMap::new()),
        }
    }
}

impl LoadBalancer for FastestResponse {
    fn next_server(&self, pool: &BackendPool, _client_key: Option<&str>) -> Option<Arc<Backend>> {
        let healthy = pool.healthy();
        if healthy.is_empty() {
            return None;
        }

        let averages: Vec<f64> = {
            let trackers = self.trackers();
            healthy
                .iter()
                .map(|b| {
                    trackers
                        .get(&b.id)
                        .map_or(ResponseTimeTracker::DEFAULT_AVERAGE_MS, ResponseTimeTracker::average)
                })
                .collect()
        };

        let max_connections = healthy.iter().map(|b| b.active_connections()).max().unwrap_or(0);
        let max_average = averages.iter().copied().fold(0.0, f64::max);

        let mut best: Option<(f64, usize)> = None;
        for (index, backend) in healthy.iter().enumerate() {
            let connection_score = if max_connections > 0 {
                backend.active_connections() as f64 / max_connections as f64
            } else {
                0.0
            };
            let response_score = if max_average > 0.0 {
                averages[index] / max_average
            } else {
                0.0
            };
            let score = connection_score * self.connection_weight
                + response_score * self.response_time_weight;
            if best.map_or(true, |(min, _)| score < min) {
                best = Some((score, index));
            }
        }

        best.map(|(_, index)| Arc::clone(&healthy[index]))
    }

    fn name(&self) -> &'static str {
        "fastest_response"
    }

    fn observe_response_time(&self, backend: &Backend, elapsed: Duration) {
        self.trackers()
            .entry(backend.id.clone())
            .or_default()
            .record(elapsed.as_secs_f64() * 1000.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> BackendPool {
        BackendPool::with_backends([
            Backend::new("b1", "127.0.0.1", 8001, 1).unwrap(),
            Backend::new("b2", "127.0.0.1", 8002, 1).unwrap(),
        ])
    }

    #[test]
    fn tracker_window_is_bounded() {
        let mut tracker = ResponseTimeTracker::default();
        assert_eq!(tracker.average(), 100.0);
        for i in 0..150 {
            tracker.record(i as f64);
        }
        let stats = tracker.stats();
        assert_eq!(stats.count, 100);
        assert_eq!(stats.min_ms, 50.0);
        assert_eq!(stats.max_ms, 149.0);
    }

    #[test]
    fn prefers_faster_backend() {
        let lb = FastestResponse::default();
        let pool = pool();
        let b1 = pool.get("b1").unwrap();
        let b2 = pool.get("b2").unwrap();
        lb.observe_response_time(&b1, Duration::from_millis(200));
        lb.observe_response_time(&b2, Duration::from_millis(20));

        assert_eq!(lb.next_server(&pool, None).unwrap().id, "b2");
        assert!(lb.response_time_stats("b2").unwrap().average_ms < 21.0);
    }

    #[test]
    fn connections_outweigh_small_latency_gap() {
        let lb = FastestResponse::default();
        let pool = pool();
        let b1 = pool.get("b1").unwrap();
        let b2 = pool.get("b2").unwrap();
        lb.observe_response_time(&b1, Duration::from_millis(100));
        lb.observe_response_time(&b2, Duration::from_millis(90));
        for _ in 0..5 {
            b2.increment_active();
        }

        // b1: 0.6*0 + 0.4*1.0 = 0.4, b2: 0.6*1.0 + 0.4*0.9 = 0.96
        assert_eq!(lb.next_server(&pool, None).unwrap().id, "b1");

        lb.reset();
        assert!(lb.response_time_stats("b1").is_none());
    }

    #[test]
    fn rejects_bad_weights() {
        assert!(FastestResponse::new(-1.0, 0.4).is_err());
        assert!(FastestResponse::new(0.0, 0.0).is_err());
        assert!(FastestResponse::new(1.0, 0.0).is_ok());
    }
}
