//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (routes reference existing backend groups)
//! - Validate value ranges (weights >= 1, thresholds > 0, positive finite rates)
//!
//! Returns all validation errors, not just the first.

use std::collections::HashSet;
use std::net::SocketAddr;

use crate::config::schema::{LimiterConfig, ProxyConfig};

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    /// Dotted path of the offending field, e.g. `backends[2].weight`.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_addr(&mut errors, "listener.bind_address", &config.listener.bind_address);
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be > 0"));
    }

    let mut ids = HashSet::new();
    let mut groups = HashSet::new();
    for (i, backend) in config.backends.iter().enumerate() {
        if !ids.insert(backend.id.as_str()) {
            errors.push(ValidationError::new(
                format!("backends[{}].id", i),
                format!("duplicate backend id '{}'", backend.id),
            ));
        }
        if backend.weight == 0 {
            errors.push(ValidationError::new(format!("backends[{}].weight", i), "must be >= 1"));
        }
        if backend.host.is_empty() {
            errors.push(ValidationError::new(format!("backends[{}].host", i), "must not be empty"));
        }
        groups.insert(backend.group.as_str());
    }

    let mut defaults = 0;
    for (i, route) in config.routes.iter().enumerate() {
        if !groups.contains(route.backend_group.as_str()) {
            errors.push(ValidationError::new(
                format!("routes[{}].backend_group", i),
                format!("unknown backend group '{}'", route.backend_group),
            ));
        }
        if !route.path.starts_with('/') {
            errors.push(ValidationError::new(format!("routes[{}].path", i), "must start with '/'"));
        }
        if route.default {
            defaults += 1;
        }
    }
    if defaults > 1 {
        errors.push(ValidationError::new("routes", "at most one default route is allowed"));
    }

    let balancer = &config.balancer;
    if balancer.virtual_nodes == 0 {
        errors.push(ValidationError::new("balancer.virtual_nodes", "must be >= 1"));
    }
    if !balancer.connection_weight.is_finite()
        || !balancer.response_time_weight.is_finite()
        || balancer.connection_weight < 0.0
        || balancer.response_time_weight < 0.0
        || balancer.connection_weight + balancer.response_time_weight <= 0.0
    {
        errors.push(ValidationError::new(
            "balancer.connection_weight",
            "fastest response weights must be non-negative with a positive sum",
        ));
    }

    let health = &config.health_check;
    if health.enabled {
        if health.interval_secs == 0 {
            errors.push(ValidationError::new("health_check.interval_secs", "must be > 0"));
        }
        if health.timeout_secs == 0 || health.timeout_secs > health.interval_secs {
            errors.push(ValidationError::new(
                "health_check.timeout_secs",
                "must be > 0 and no longer than interval_secs",
            ));
        }
        if health.healthy_threshold == 0 || health.unhealthy_threshold == 0 {
            errors.push(ValidationError::new("health_check", "thresholds must be > 0"));
        }
    }

    if config.timeouts.connect_secs == 0 || config.timeouts.request_secs == 0 {
        errors.push(ValidationError::new("timeouts", "timeouts must be > 0"));
    }

    if config.rate_limit.enabled {
        for (i, limiter) in config.rate_limit.limiters.iter().enumerate() {
            let field = format!("rate_limit.limiters[{}]", i);
            let ok = match *limiter {
                LimiterConfig::TokenBucket { capacity, refill_rate } => {
                    finite(&[capacity, refill_rate]) && capacity >= 1.0 && refill_rate >= 0.0
                }
                LimiterConfig::SlidingWindow { max_requests, window_secs } => {
                    finite(&[window_secs]) && max_requests > 0 && window_secs > 0.0
                }
                LimiterConfig::LeakyBucket { capacity, leak_rate } => {
                    finite(&[capacity, leak_rate]) && capacity >= 1.0 && leak_rate >= 0.0
                }
            };
            if !ok {
                errors.push(ValidationError::new(
                    field,
                    "capacity and window must be positive, rates non-negative, all finite",
                ));
            }
        }
        if config.rate_limit.cleanup_interval_secs == 0 || config.rate_limit.key_idle_secs == 0 {
            errors.push(ValidationError::new("rate_limit", "cleanup interval and key idle time must be > 0"));
        }
    }

    let breaker = &config.circuit_breaker;
    if breaker.enabled
        && (breaker.failure_threshold == 0 || breaker.success_threshold == 0 || breaker.window_secs == 0)
    {
        errors.push(ValidationError::new("circuit_breaker", "thresholds and window must be > 0"));
    }

    if config.session.timeout_secs == 0 || config.session.sweep_interval_secs == 0 {
        errors.push(ValidationError::new("session", "timeout and sweep interval must be > 0"));
    }

    let tcp = &config.tcp;
    if tcp.enabled {
        check_addr(&mut errors, "tcp.bind_address", &tcp.bind_address);
        if !groups.contains(tcp.backend_group.as_str()) {
            errors.push(ValidationError::new(
                "tcp.backend_group",
                format!("unknown backend group '{}'", tcp.backend_group),
            ));
        }
        if tcp.max_connections == 0 || tcp.buffer_size == 0 {
            errors.push(ValidationError::new("tcp", "max_connections and buffer_size must be > 0"));
        }
        if tcp.idle_timeout_secs == 0 || tcp.sweep_interval_secs == 0 || tcp.connect_timeout_secs == 0 {
            errors.push(ValidationError::new("tcp", "timeouts and sweep interval must be > 0"));
        }
    }

    if config.discovery.watch_enabled && config.discovery.watch_interval_secs == 0 {
        errors.push(ValidationError::new("discovery.watch_interval_secs", "must be > 0"));
    }

    // Heartbeats come from passing health checks, so expiry needs them running
    // and a ttl longer than one probe round.
    let ttl = config.discovery.instance_ttl_secs;
    if ttl > 0 {
        if !health.enabled {
            errors.push(ValidationError::new(
                "discovery.instance_ttl_secs",
                "instance expiry requires health_check.enabled",
            ));
        } else if ttl <= health.interval_secs.saturating_add(health.timeout_secs) {
            errors.push(ValidationError::new(
                "discovery.instance_ttl_secs",
                "must exceed health_check.interval_secs + timeout_secs",
            ));
        }
    }

    if config.observability.metrics_enabled {
        check_addr(&mut errors, "observability.metrics_address", &config.observability.metrics_address);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn finite(values: &[f64]) -> bool {
    values.iter().all(|v| v.is_finite())
}

fn check_addr(errors: &mut Vec<ValidationError>, field: &str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(field, format!("'{}' is not a socket address", value)));
    }
}
