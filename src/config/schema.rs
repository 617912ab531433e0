//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the balancer.
//! All types derive Serde traits for deserialization from config files, and
//! every section has defaults so minimal configs work.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::load_balancer::{Algorithm, HashFunction};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// HTTP listener configuration.
    pub listener: ListenerConfig,

    /// Route definitions mapping request paths to backend groups.
    pub routes: Vec<RouteConfig>,

    /// Backend server definitions.
    pub backends: Vec<BackendConfig>,

    /// Default selection algorithm and its tuning knobs.
    pub balancer: BalancerConfig,

    pub health_check: HealthCheckConfig,

    pub timeouts: TimeoutConfig,

    pub rate_limit: RateLimitConfig,

    pub circuit_breaker: CircuitBreakerConfig,

    pub session: SessionConfig,

    /// Raw TCP proxy.
    pub tcp: TcpProxyConfig,

    pub discovery: DiscoveryConfig,

    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum concurrent client connections.
    pub max_connections: usize,

    /// Maximum request body size in bytes.
    pub max_body_size: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_connections: 10_000,
            max_body_size: 2 * 1024 * 1024,
        }
    }
}

/// Route configuration mapping a path to a backend group.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    /// Route identifier for logging, metrics and its circuit breaker.
    pub name: String,

    /// Path to match. Exact unless `prefix` is set.
    pub path: String,

    /// Match any path starting with `path`.
    #[serde(default)]
    pub prefix: bool,

    /// Fallback route when nothing else matches.
    #[serde(default)]
    pub default: bool,

    /// Backend group name to forward to.
    pub backend_group: String,

    /// Overrides the balancer algorithm for this route.
    #[serde(default)]
    pub algorithm: Option<Algorithm>,

    /// Replace the matched `path` portion with this value before forwarding.
    #[serde(default)]
    pub rewrite_path: Option<String>,

    /// Headers added to the upstream request.
    #[serde(default)]
    pub add_headers: BTreeMap<String, String>,

    /// Headers removed from the upstream request.
    #[serde(default)]
    pub remove_headers: Vec<String>,

    #[serde(default)]
    pub enable_cors: bool,

    #[serde(default)]
    pub enable_session_affinity: bool,
}

impl RouteConfig {
    /// Prefix route to `backend_group` with every option off.
    pub fn new(name: impl Into<String>, path: impl Into<String>, backend_group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            prefix: true,
            default: false,
            backend_group: backend_group.into(),
            algorithm: None,
            rewrite_path: None,
            add_headers: BTreeMap::new(),
            remove_headers: Vec::new(),
            enable_cors: false,
            enable_session_affinity: false,
        }
    }
}

/// Backend server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Unique backend identifier.
    pub id: String,

    /// Backend group (service name) this server belongs to.
    pub group: String,

    pub host: String,

    pub port: u16,

    /// Weight for weighted load balancing (default: 1).
    #[serde(default = "default_weight")]
    pub weight: u32,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl BackendConfig {
    pub fn new(id: impl Into<String>, group: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            group: group.into(),
            host: host.into(),
            port,
            weight: default_weight(),
            tags: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }
}

fn default_weight() -> u32 {
    1
}

/// Selection algorithm configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BalancerConfig {
    pub algorithm: Algorithm,

    /// Ring points per backend for consistent hashing.
    pub virtual_nodes: u32,

    pub hash_function: HashFunction,

    /// Fastest-response score weight of the connection component.
    pub connection_weight: f64,

    /// Fastest-response score weight of the response time component.
    pub response_time_weight: f64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::RoundRobin,
            virtual_nodes: 150,
            hash_function: HashFunction::Sha256,
            connection_weight: 0.6,
            response_time_weight: 0.4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    #[default]
    Http,
    Tcp,
}

/// Health check configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Enable active health checks.
    pub enabled: bool,

    pub kind: ProbeKind,

    /// Health check interval in seconds.
    pub interval_secs: u64,

    /// Per-probe timeout in seconds.
    pub timeout_secs: u64,

    /// Path to probe for HTTP health checks.
    pub path: String,

    /// Number of consecutive failures before marking unhealthy.
    pub unhealthy_threshold: u32,

    /// Number of consecutive successes before marking healthy.
    pub healthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            kind: ProbeKind::Http,
            interval_secs: 10,
            timeout_secs: 5,
            path: "/health".to_string(),
            unhealthy_threshold: 1,
            healthy_threshold: 1,
        }
    }
}

/// Timeout configuration for upstream calls.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Connection establishment timeout in seconds.
    pub connect_secs: u64,

    /// Request timeout (total time for request/response) in seconds.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 5,
            request_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CombineMode {
    /// Every limiter must admit.
    #[default]
    All,
    /// One admitting limiter is enough.
    Any,
}

/// One limiter in the rate limiting stack.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LimiterConfig {
    TokenBucket { capacity: f64, refill_rate: f64 },
    SlidingWindow { max_requests: usize, window_secs: f64 },
    LeakyBucket { capacity: f64, leak_rate: f64 },
}

/// Rate limiting configuration. Keys are client IPs.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,

    /// How several limiters are combined.
    pub combine: CombineMode,

    pub limiters: Vec<LimiterConfig>,

    /// Seconds between sweeps of idle client state.
    pub cleanup_interval_secs: u64,

    /// Client state untouched for this many seconds is dropped.
    pub key_idle_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            combine: CombineMode::All,
            limiters: vec![LimiterConfig::TokenBucket {
                capacity: 100.0,
                refill_rate: 10.0,
            }],
            cleanup_interval_secs: 60,
            key_idle_secs: 300,
        }
    }
}

/// Circuit breaker configuration, applied per route.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,

    /// Failures within the window that open the circuit.
    pub failure_threshold: u64,

    /// Consecutive half-open successes that close the circuit.
    pub success_threshold: u64,

    /// Seconds the circuit stays open before a trial.
    pub timeout_secs: u64,

    /// Trailing window for failure counting, in seconds.
    pub window_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            success_threshold: 3,
            timeout_secs: 60,
            window_secs: 60,
        }
    }
}

/// Session affinity configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle seconds after which a binding expires.
    pub timeout_secs: u64,

    /// Seconds between expiry sweeps.
    pub sweep_interval_secs: u64,

    pub cookie_name: String,

    pub header_name: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 3600,
            sweep_interval_secs: 300,
            cookie_name: "LB_SESSION_ID".to_string(),
            header_name: "X-Session-ID".to_string(),
        }
    }
}

/// Raw TCP proxy configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TcpProxyConfig {
    pub enabled: bool,

    pub bind_address: String,

    /// Backend group to forward to.
    pub backend_group: String,

    /// Concurrent client connections; extra connections are refused.
    pub max_connections: usize,

    pub connect_timeout_secs: u64,

    /// Connections without traffic for this long are closed.
    pub idle_timeout_secs: u64,

    pub sweep_interval_secs: u64,

    pub buffer_size: usize,
}

impl Default for TcpProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: "0.0.0.0:9000".to_string(),
            backend_group: "default".to_string(),
            max_connections: 1000,
            connect_timeout_secs: 10,
            idle_timeout_secs: 1800,
            sweep_interval_secs: 60,
            buffer_size: 32 * 1024,
        }
    }
}

/// Registry watching and instance expiry.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Sync backend pools from registry changes.
    pub watch_enabled: bool,

    pub watch_interval_secs: u64,

    /// Instances without a heartbeat for this long are removed. 0 disables.
    pub instance_ttl_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            watch_enabled: true,
            watch_interval_secs: 5,
            instance_ttl_secs: 0,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive.
    pub log_level: String,

    /// One JSON object per log line.
    pub json_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_toml() {
        let config: ProxyConfig = toml::from_str(
            r#"
            [balancer]
            algorithm = "consistent_hash"
            hash_function = "fnv1a"

            [[backends]]
            id = "b1"
            group = "web"
            host = "127.0.0.1"
            port = 8081
            weight = 2

            [[routes]]
            name = "api"
            path = "/api"
            prefix = true
            backend_group = "web"
            algorithm = "least_connections"

            [rate_limit]
            enabled = true
            combine = "any"

            [[rate_limit.limiters]]
            kind = "sliding_window"
            max_requests = 10
            window_secs = 1.0
            "#,
        )
        .unwrap();

        assert_eq!(config.balancer.algorithm, Algorithm::ConsistentHash);
        assert_eq!(config.balancer.hash_function, HashFunction::Fnv1a);
        assert_eq!(config.balancer.virtual_nodes, 150);
        assert_eq!(config.backends[0].weight, 2);
        assert_eq!(config.routes[0].algorithm, Some(Algorithm::LeastConnections));
        assert_eq!(config.rate_limit.combine, CombineMode::Any);
        assert_eq!(
            config.rate_limit.limiters,
            vec![LimiterConfig::SlidingWindow { max_requests: 10, window_secs: 1.0 }]
        );
        assert_eq!(config.session.cookie_name, "LB_SESSION_ID");
    }
}
