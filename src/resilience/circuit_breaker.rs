//! Circuit breaker.
//!
//! # State machine
//! ```text
//! CLOSED ──(failures in window >= failure_threshold)──▶ OPEN
//! OPEN ──(first can_execute after next_attempt)──────▶ HALF_OPEN
//! HALF_OPEN ──(success_threshold successes)──────────▶ CLOSED
//! HALF_OPEN ──(any failure)──────────────────────────▶ OPEN
//! ```
//!
//! Decision and update happen under one mutex, never held across I/O.
//! Time comes from `tokio::time::Instant` so paused-clock tests can drive it.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;
use crate::observability::metrics;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests are rejected until the timeout elapses.
    Open,
    /// Trial requests are let through to probe recovery.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    /// Meaningful only while OPEN.
    next_attempt: Option<Instant>,
    failure_count: u64,
    success_count: u64,
    total_requests: u64,
    total_failures: u64,
    total_successes: u64,
    /// (timestamp, success) for the trailing window.
    history: VecDeque<(Instant, bool)>,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            next_attempt: None,
            failure_count: 0,
            success_count: 0,
            total_requests: 0,
            total_failures: 0,
            total_successes: 0,
            history: VecDeque::new(),
        }
    }

    fn purge(&mut self, now: Instant, window: Duration) {
        while let Some((ts, _)) = self.history.front() {
            if now.duration_since(*ts) >= window {
                self.history.pop_front();
            } else {
                break;
            }
        }
    }

    fn recent_failures(&self) -> u64 {
        self.history.iter().filter(|(_, ok)| !ok).count() as u64
    }
}

/// Failure-isolation state machine for one protected target.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u64,
    success_threshold: u64,
    timeout: Duration,
    window: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            failure_threshold: config.failure_threshold.max(1),
            success_threshold: config.success_threshold.max(1),
            timeout: Duration::from_secs(config.timeout_secs),
            window: Duration::from_secs(config.window_secs),
            inner: Mutex::new(Inner::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a call may proceed. Moves OPEN to HALF_OPEN once the timeout elapsed.
    pub fn can_execute(&self) -> bool {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.purge(now, self.window);

        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let due = inner.next_attempt.map_or(true, |at| now >= at);
                if due {
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    inner.next_attempt = None;
                    tracing::info!(breaker = %self.name, "Circuit half-open, probing recovery");
                    metrics::record_circuit_state(&self.name, CircuitState::HalfOpen);
                }
                due
            }
        }
    }

    pub fn record_success(&self) {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.total_requests += 1;
        inner.total_successes += 1;
        inner.history.push_back((now, true));
        inner.purge(now, self.window);

        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.success_threshold {
                    self.close(&mut inner);
                }
            }
            CircuitState::Closed => {
                inner.failure_count = inner.failure_count.saturating_sub(1);
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.total_requests += 1;
        inner.total_failures += 1;
        inner.history.push_back((now, false));
        inner.purge(now, self.window);

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.recent_failures() >= self.failure_threshold {
                    self.open(&mut inner, now);
                }
            }
            CircuitState::HalfOpen => self.open(&mut inner, now),
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.purge(now, self.window);

        let recent_requests = inner.history.len() as u64;
        let recent_failures = inner.recent_failures();
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            timeout_secs: self.timeout.as_secs(),
            window_secs: self.window.as_secs(),
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            total_requests: inner.total_requests,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
            recent_requests,
            recent_failures,
            recent_successes: recent_requests - recent_failures,
            failure_rate: if recent_requests > 0 {
                recent_failures as f64 / recent_requests as f64 * 100.0
            } else {
                0.0
            },
            retry_in_ms: inner
                .next_attempt
                .filter(|_| inner.state == CircuitState::Open)
                .map(|at| at.saturating_duration_since(now).as_millis() as u64),
        }
    }

    pub fn force_open(&self) {
        let mut inner = self.lock();
        self.open(&mut inner, Instant::now());
    }

    pub fn force_close(&self) {
        let mut inner = self.lock();
        self.close(&mut inner);
    }

    /// Back to a fresh CLOSED breaker with all counters cleared.
    pub fn reset(&self) {
        *self.lock() = Inner::new();
        metrics::record_circuit_state(&self.name, CircuitState::Closed);
    }

    fn open(&self, inner: &mut Inner, now: Instant) {
        inner.state = CircuitState::Open;
        inner.next_attempt = Some(now + self.timeout);
        inner.success_count = 0;
        tracing::warn!(
            breaker = %self.name,
            failures = inner.failure_count,
            timeout_secs = self.timeout.as_secs(),
            "Circuit opened"
        );
        metrics::record_circuit_state(&self.name, CircuitState::Open);
    }

    fn close(&self, inner: &mut Inner) {
        inner.state = CircuitState::Closed;
        inner.next_attempt = None;
        inner.failure_count = 0;
        inner.success_count = 0;
        tracing::info!(breaker = %self.name, "Circuit closed");
        metrics::record_circuit_state(&self.name, CircuitState::Closed);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_threshold: u64,
    pub success_threshold: u64,
    pub timeout_secs: u64,
    pub window_secs: u64,
    pub failure_count: u64,
    pub success_count: u64,
    pub total_requests: u64,
    pub total_failures: u64,
    pub total_successes: u64,
    pub recent_requests: u64,
    pub recent_failures: u64,
    pub recent_successes: u64,
    /// Percentage of failures in the trailing window.
    pub failure_rate: f64,
    /// Time until the next trial, only while OPEN.
    pub retry_in_ms: Option<u64>,
}

/// Named breakers created on first use, one per route or backend.
#[derive(Debug)]
pub struct BreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.breakers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(name, &self.config)))
                .value(),
        )
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| Arc::clone(b.value()))
    }

    pub fn remove(&self, name: &str) -> bool {
        self.breakers.remove(name).is_some()
    }

    pub fn all_stats(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<_> = self.breakers.iter().map(|b| b.value().stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.iter() {
            breaker.value().reset();
        }
    }
}
