//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Request to a route:
//!     → circuit_breaker.rs (reject while the route's circuit is open)
//!     → upstream outcome recorded as success or failure
//!     → enough failures in the window open the circuit
//! ```
//!
//! # Design Decisions
//! - One breaker per route, created on first use
//! - Any upstream response counts as success; only transport failures trip it

pub mod circuit_breaker;

pub use circuit_breaker::{BreakerRegistry, CircuitBreaker, CircuitBreakerStats, CircuitState};
