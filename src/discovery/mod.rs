//! Service discovery subsystem.
//!
//! # Data Flow
//! ```text
//! register / deregister / heartbeat
//!     → registry.rs (service → instance id → instance)
//!     ← health checker updates instance status
//!     → watcher.rs (periodic diff per watched service)
//!     → watch channel → backend pool sync
//! ```
//!
//! # Design Decisions
//! - Registry is process-local and owned, never a global
//! - `discover` only returns HEALTHY instances
//! - Watch subscribers always see the latest healthy set, not every intermediate one

pub mod registry;
pub mod watcher;

pub use registry::{InMemoryRegistry, RegistryError, ServiceInstance, ServiceRegistry, ServiceStatus};
pub use watcher::{ServiceWatcher, WatcherStats};
