//! Software load balancer library.
//!
//! HTTP and raw TCP front ends over shared backend groups, with pluggable
//! selection strategies, active health checking, rate limiting, per-route
//! circuit breakers and session affinity.

pub mod config;
pub mod discovery;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod load_balancer;
pub mod net;
pub mod observability;
pub mod resilience;
pub mod routing;
pub mod security;

pub use config::schema::ProxyConfig;
pub use http::{HttpProxy, HttpServer};
pub use lifecycle::{Components, Shutdown};
pub use net::TcpProxy;
