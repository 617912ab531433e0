//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ProxyConfig (validated, immutable)
//!     → handed to lifecycle::startup to build components
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    BackendConfig, BalancerConfig, CircuitBreakerConfig, CombineMode, DiscoveryConfig,
    HealthCheckConfig, LimiterConfig, ListenerConfig, ObservabilityConfig, ProbeKind, ProxyConfig,
    RateLimitConfig, RouteConfig, SessionConfig, TcpProxyConfig, TimeoutConfig,
};
pub use validation::{validate_config, ValidationError};
