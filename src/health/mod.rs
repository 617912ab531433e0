//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Active checks (checker.rs):
//!     Periodic timer
//!     → probe.rs (HTTP GET or TCP connect, each under a timeout)
//!     → consecutive-result thresholds
//!     → on transition: registry status + listeners
//!
//! Passive checks:
//!     Proxy fails to connect to a backend
//!     → mark_backend_down (immediate, bypasses the failure threshold)
//!     → same registry and listener notification path
//!     → active probes bring the backend back
//! ```
//!
//! # Design Decisions
//! - Probe failures are "unhealthy", never errors
//! - Listeners are called outside every internal lock
//! - Health state is per-instance, not per-pool

pub mod checker;
pub mod probe;

pub use checker::{HealthChecker, HealthStats};
pub use probe::Prober;

use crate::load_balancer::backend::Backend;

/// Take a backend out of rotation after a failed connection attempt.
///
/// Backends the checker does not track are flagged directly on the pool entry.
pub fn mark_backend_down(checker: &HealthChecker, backend: &Backend) {
    if !checker.mark_unhealthy(&backend.id) {
        backend.set_healthy(false);
    }
    tracing::warn!(backend = %backend.id, address = %backend.address(), "Backend connection failed, marked unhealthy");
}

/// Receives health transitions.
pub trait HealthListener: Send + Sync {
    fn on_health_change(&self, instance_id: &str, healthy: bool);
}

impl<F> HealthListener for F
where
    F: Fn(&str, bool) + Send + Sync,
{
    fn on_health_change(&self, instance_id: &str, healthy: bool) {
        self(instance_id, healthy)
    }
}
