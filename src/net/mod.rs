//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection cap, refuse over the cap)
//!     → tcp_proxy.rs (backend selection, connect with timeout)
//!     → connection.rs (id, activity and byte tracking, idle close)
//!     → bidirectional byte pump until EOF
//! ```
//!
//! # Design Decisions
//! - Each connection tracked so shutdown and the idle sweep can close it
//! - Connection slots are semaphore permits held for the connection's lifetime

pub mod connection;
pub mod listener;
pub mod tcp_proxy;

pub use listener::{Listener, ListenerError};
pub use tcp_proxy::{TcpProxy, TcpProxyStats};
