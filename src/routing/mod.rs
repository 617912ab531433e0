//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming Request (path, headers, client ip)
//!     → router.rs (exact path → longest prefix → default route)
//!     → Route: backend group balancer, rewrite, header rules
//!     → session.rs (optional affinity override of the selected backend)
//!
//! Route Compilation (at startup):
//!     RouteConfig[] + BackendManager
//!     → one Balancer per route (shared group pool, optional algorithm override)
//!     → Freeze as immutable RouteTable
//! ```
//!
//! # Design Decisions
//! - Routes compiled at startup, immutable at runtime
//! - No regex in hot path (exact and prefix matching only)
//! - Session bindings expire on idle time, not age

pub mod router;
pub mod session;

pub use router::{Route, RouteError, RouteTable};
pub use session::{SessionManager, SessionStats};
