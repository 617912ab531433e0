//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, request ID, body and concurrency limits)
//!     → routing (route table match)
//!     → rate limiter / circuit breaker admission
//!     → load_balancer picks a backend, session affinity may override it
//!     → request.rs (rewrite URI, forwarding headers)
//!     → hyper client → backend
//!     → response.rs (strip hop-by-hop, X-Backend-Server, CORS)
//!     → Send to client
//! ```

pub mod request;
pub mod response;
pub mod server;

pub use request::X_REQUEST_ID;
pub use response::{ProxyError, ProxyStatsSnapshot};
pub use server::{HttpProxy, HttpServer, ProxyOverview};
