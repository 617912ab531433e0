//! Backend pool management.
//!
//! # Responsibilities
//! - Hold the membership of one backend group (`BackendPool`)
//! - Group pools by name and attach a selection strategy (`BackendManager`)
//! - Apply health transitions coming from the health checker

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::config::{BackendConfig, BalancerConfig};
use crate::health::HealthListener;
use crate::load_balancer::{backend::Backend, Balancer, BalancerError};

/// Concurrency-safe set of backends for one group.
///
/// Membership lives behind a reader-writer lock; every membership change bumps
/// `generation` so strategies that cache derived structures (the hash ring)
/// know when to rebuild.
#[derive(Debug, Default)]
pub struct BackendPool {
    backends: RwLock<Vec<Arc<Backend>>>,
    generation: AtomicU64,
}

impl BackendPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a pool from already constructed backends.
    pub fn with_backends(backends: impl IntoIterator<Item = Backend>) -> Self {
        let pool = Self::new();
        for backend in backends {
            pool.add(backend);
        }
        pool
    }

    /// Add a backend. An existing backend with the same id is replaced in place.
    pub fn add(&self, backend: Backend) -> Arc<Backend> {
        let backend = Arc::new(backend);
        let mut guard = self.backends.write().unwrap_or_else(PoisonError::into_inner);
        match guard.iter_mut().find(|b| b.id == backend.id) {
            Some(slot) => *slot = Arc::clone(&backend),
            None => guard.push(Arc::clone(&backend)),
        }
        self.generation.fetch_add(1, Ordering::Release);
        backend
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Backend>> {
        let mut guard = self.backends.write().unwrap_or_else(PoisonError::into_inner);
        let index = guard.iter().position(|b| b.id == id)?;
        let removed = guard.remove(index);
        self.generation.fetch_add(1, Ordering::Release);
        Some(removed)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Backend>> {
        self.read().iter().find(|b| b.id == id).cloned()
    }

    /// All backends in insertion order.
    pub fn all(&self) -> Vec<Arc<Backend>> {
        self.read().clone()
    }

    /// Healthy backends in insertion order.
    pub fn healthy(&self) -> Vec<Arc<Backend>> {
        self.read().iter().filter(|b| b.is_healthy()).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Membership and generation read under the same lock.
    pub fn snapshot(&self) -> (u64, Vec<Arc<Backend>>) {
        let guard = self.read();
        (self.generation.load(Ordering::Acquire), guard.clone())
    }

    /// Set the health flag of a member. Returns false if the id is unknown.
    pub fn set_health(&self, id: &str, healthy: bool) -> bool {
        match self.get(id) {
            Some(backend) => {
                backend.set_healthy(healthy);
                true
            }
            None => false,
        }
    }

    /// Replace membership with `backends`.
    ///
    /// Members whose id, address and weight are unchanged keep their `Arc` and
    /// therefore their live counters. Returns true if membership changed.
    pub fn sync(&self, backends: Vec<Backend>) -> bool {
        let mut guard = self.backends.write().unwrap_or_else(PoisonError::into_inner);

        let mut changed = guard.len() != backends.len();
        let mut next = Vec::with_capacity(backends.len());
        for incoming in backends {
            let existing = guard.iter().find(|b| {
                b.id == incoming.id
                    && b.host == incoming.host
                    && b.port == incoming.port
                    && b.weight == incoming.weight
            });
            match existing {
                Some(current) => {
                    current.set_healthy(incoming.is_healthy());
                    next.push(Arc::clone(current));
                }
                None => {
                    changed = true;
                    next.push(Arc::new(incoming));
                }
            }
        }

        if changed {
            *guard = next;
            self.generation.fetch_add(1, Ordering::Release);
        }
        changed
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<Backend>>> {
        self.backends.read().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Manages backend groups and their balancers.
#[derive(Debug, Default)]
pub struct BackendManager {
    /// Map of backend group name -> balancer over that group's pool.
    groups: HashMap<String, Arc<Balancer>>,
}

impl BackendManager {
    /// Create a backend manager from configuration.
    pub fn new(configs: &[BackendConfig], balancer: &BalancerConfig) -> Result<Self, BalancerError> {
        let mut pools: HashMap<String, Vec<Backend>> = HashMap::new();
        for config in configs {
            let backend = Backend::new(&config.id, &config.host, config.port, config.weight)?;
            pools.entry(config.group.clone()).or_default().push(backend);
        }

        let mut groups = HashMap::new();
        for (name, backends) in pools {
            let pool = Arc::new(BackendPool::with_backends(backends));
            let balancer = Balancer::from_config(pool, balancer.algorithm, balancer)?;
            tracing::info!(
                group = %name,
                backends = balancer.pool().len(),
                algorithm = balancer.algorithm(),
                "Backend group ready"
            );
            groups.insert(name, Arc::new(balancer));
        }

        Ok(Self { groups })
    }

    /// Balancer for the given group.
    pub fn group(&self, name: &str) -> Option<Arc<Balancer>> {
        self.groups.get(name).cloned()
    }

    pub fn pool(&self, name: &str) -> Option<Arc<BackendPool>> {
        self.groups.get(name).map(|b| Arc::clone(b.pool()))
    }

    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    /// Return a list of all backends across groups.
    pub fn all_backends(&self) -> Vec<Arc<Backend>> {
        self.groups
            .values()
            .flat_map(|balancer| balancer.pool().all())
            .collect()
    }

    /// Apply a health flag to every pool containing `id`.
    pub fn set_health(&self, id: &str, healthy: bool) -> bool {
        let mut found = false;
        for balancer in self.groups.values() {
            found |= balancer.pool().set_health(id, healthy);
        }
        found
    }
}

impl HealthListener for BackendManager {
    fn on_health_change(&self, instance_id: &str, healthy: bool) {
        if !self.set_health(instance_id, healthy) {
            tracing::debug!(instance = %instance_id, "Health change for backend not in any pool");
        }
    }
}
