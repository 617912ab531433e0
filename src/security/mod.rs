//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → rate_limit.rs (per-client-IP admission)
//!     → [routing, breaker, backend selection]
//!     → headers.rs (strip hop-by-hop, set X-Forwarded-*)
//!     → upstream
//!
//! Backend response:
//!     → headers.rs (strip hop-by-hop, X-Backend-Server, CORS)
//! ```
//!
//! # Design Decisions
//! - Fail closed: a rejected request never reaches a backend
//! - Forwarding headers are overwritten with the resolved client address

pub mod headers;
pub mod rate_limit;

pub use rate_limit::{RateLimiter, RateLimiterStats};
