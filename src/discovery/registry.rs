//! Service registry.
//!
//! # Responsibilities
//! - Map service name → instance id → instance
//! - Track instance status and last-seen time
//! - Expire instances that stop heartbeating

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::BackendConfig;
use crate::load_balancer::backend::Backend;
use crate::load_balancer::BalancerError;

/// Instance lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    #[default]
    Healthy,
    Unhealthy,
    Starting,
    Stopping,
    Unknown,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceStatus::Healthy => "healthy",
            ServiceStatus::Unhealthy => "unhealthy",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Stopping => "stopping",
            ServiceStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A registered instance of a service.
#[derive(Debug, Clone)]
pub struct ServiceInstance {
    pub id: String,
    /// Service (backend group) name.
    pub service: String,
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub status: ServiceStatus,
    pub metadata: BTreeMap<String, String>,
    pub tags: Vec<String>,
    pub registered_at: Instant,
    pub last_seen: Instant,
}

impl ServiceInstance {
    /// New healthy instance with a generated id.
    pub fn new(service: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4().to_string(),
            service: service.into(),
            host: host.into(),
            port,
            weight: 1,
            status: ServiceStatus::Healthy,
            metadata: BTreeMap::new(),
            tags: Vec::new(),
            registered_at: now,
            last_seen: now,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_status(mut self, status: ServiceStatus) -> Self {
        self.status = status;
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_healthy(&self) -> bool {
        self.status == ServiceStatus::Healthy
    }

    /// Backend for this instance; healthy only when the status is HEALTHY.
    pub fn to_backend(&self) -> Result<Backend, BalancerError> {
        let backend = Backend::new(&self.id, &self.host, self.port, self.weight)?;
        backend.set_healthy(self.is_healthy());
        Ok(backend)
    }
}

impl From<&BackendConfig> for ServiceInstance {
    fn from(config: &BackendConfig) -> Self {
        let mut instance = ServiceInstance::new(&config.group, &config.host, config.port)
            .with_id(&config.id)
            .with_weight(config.weight);
        instance.metadata = config.metadata.clone();
        instance.tags = config.tags.clone();
        instance
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid instance '{id}': {reason}")]
    InvalidInstance { id: String, reason: String },
}

/// Registry of service instances.
pub trait ServiceRegistry: Send + Sync + fmt::Debug {
    /// Insert or replace an instance. Resets its register and last-seen times.
    fn register(&self, instance: ServiceInstance) -> Result<(), RegistryError>;

    /// Remove an instance by id. Returns false if it was not registered.
    fn deregister(&self, instance_id: &str) -> bool;

    /// HEALTHY instances of a service.
    fn discover(&self, service: &str) -> Vec<ServiceInstance>;

    /// Every instance of a service regardless of status.
    fn get_all_instances(&self, service: &str) -> Vec<ServiceInstance>;

    fn get_all_services(&self) -> HashMap<String, Vec<ServiceInstance>>;

    /// Set an instance's status and refresh its last-seen time.
    fn update_instance_status(&self, instance_id: &str, status: ServiceStatus) -> bool;

    fn get_instance(&self, instance_id: &str) -> Option<ServiceInstance>;

    /// Refresh an instance's last-seen time.
    fn heartbeat(&self, instance_id: &str) -> bool;

    /// Remove instances not seen for longer than `ttl`. Returns the removed ids.
    fn cleanup_expired(&self, ttl: Duration) -> Vec<String>;
}

/// In-process registry behind a reader-writer lock.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    services: RwLock<HashMap<String, HashMap<String, ServiceInstance>>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, HashMap<String, ServiceInstance>>> {
        self.services.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, HashMap<String, ServiceInstance>>> {
        self.services.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_instance<R>(&self, id: &str, f: impl FnOnce(&mut ServiceInstance) -> R) -> Option<R> {
        self.write()
            .values_mut()
            .find_map(|instances| instances.get_mut(id))
            .map(f)
    }
}

fn sorted(instances: impl Iterator<Item = ServiceInstance>) -> Vec<ServiceInstance> {
    let mut list: Vec<_> = instances.collect();
    list.sort_by(|a, b| a.id.cmp(&b.id));
    list
}

impl ServiceRegistry for InMemoryRegistry {
    fn register(&self, mut instance: ServiceInstance) -> Result<(), RegistryError> {
        if instance.host.is_empty() || instance.port == 0 {
            return Err(RegistryError::InvalidInstance {
                id: instance.id,
                reason: "host must be set and port non-zero".to_string(),
            });
        }
        if instance.weight == 0 {
            return Err(RegistryError::InvalidInstance {
                id: instance.id,
                reason: "weight must be >= 1".to_string(),
            });
        }

        let now = Instant::now();
        instance.registered_at = now;
        instance.last_seen = now;

        let mut services = self.write();
        // An id lives in exactly one service.
        for instances in services.values_mut() {
            instances.remove(&instance.id);
        }
        services.retain(|_, instances| !instances.is_empty());

        tracing::info!(
            instance = %instance.id,
            service = %instance.service,
            address = %instance.address(),
            "Registered service instance"
        );
        services
            .entry(instance.service.clone())
            .or_default()
            .insert(instance.id.clone(), instance);
        Ok(())
    }

    fn deregister(&self, instance_id: &str) -> bool {
        let mut services = self.write();
        let service = services
            .iter_mut()
            .find_map(|(name, instances)| instances.remove(instance_id).map(|_| name.clone()));

        match service {
            Some(name) => {
                if services.get(&name).is_some_and(HashMap::is_empty) {
                    services.remove(&name);
                }
                tracing::info!(instance = %instance_id, service = %name, "Deregistered service instance");
                true
            }
            None => false,
        }
    }

    fn discover(&self, service: &str) -> Vec<ServiceInstance> {
        let services = self.read();
        let Some(instances) = services.get(service) else {
            return Vec::new();
        };
        sorted(instances.values().filter(|i| i.is_healthy()).cloned())
    }

    fn get_all_instances(&self, service: &str) -> Vec<ServiceInstance> {
        let services = self.read();
        services
            .get(service)
            .map(|instances| sorted(instances.values().cloned()))
            .unwrap_or_default()
    }

    fn get_all_services(&self) -> HashMap<String, Vec<ServiceInstance>> {
        self.read()
            .iter()
            .map(|(name, instances)| (name.clone(), sorted(instances.values().cloned())))
            .collect()
    }

    fn update_instance_status(&self, instance_id: &str, status: ServiceStatus) -> bool {
        self.with_instance(instance_id, |instance| {
            if instance.status != status {
                tracing::info!(
                    instance = %instance_id,
                    from = %instance.status,
                    to = %status,
                    "Instance status changed"
                );
            }
            instance.status = status;
            instance.last_seen = Instant::now();
        })
        .is_some()
    }

    fn get_instance(&self, instance_id: &str) -> Option<ServiceInstance> {
        self.read()
            .values()
            .find_map(|instances| instances.get(instance_id))
            .cloned()
    }

    fn heartbeat(&self, instance_id: &str) -> bool {
        self.with_instance(instance_id, |instance| instance.last_seen = Instant::now())
            .is_some()
    }

    fn cleanup_expired(&self, ttl: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut removed = Vec::new();
        let mut services = self.write();
        for instances in services.values_mut() {
            instances.retain(|id, instance| {
                let keep = now.duration_since(instance.last_seen) <= ttl;
                if !keep {
                    tracing::info!(instance = %id, "Removed expired instance");
                    removed.push(id.clone());
                }
                keep
            });
        }
        services.retain(|_, instances| !instances.is_empty());
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str, service: &str, port: u16) -> ServiceInstance {
        ServiceInstance::new(service, "127.0.0.1", port).with_id(id)
    }

    #[test]
    fn register_discover_deregister() {
        let registry = InMemoryRegistry::new();
        registry.register(instance("a", "web", 8001)).unwrap();
        registry.register(instance("b", "web", 8002)).unwrap();
        registry.register(instance("c", "api", 8003)).unwrap();

        assert_eq!(registry.discover("web").len(), 2);
        assert!(registry.update_instance_status("a", ServiceStatus::Unhealthy));
        let healthy = registry.discover("web");
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].id, "b");
        assert_eq!(registry.get_all_instances("web").len(), 2);

        assert!(registry.deregister("c"));
        assert!(!registry.deregister("c"));
        assert!(!registry.get_all_services().contains_key("api"));
        assert!(registry.discover("missing").is_empty());
    }

    #[test]
    fn re_register_moves_between_services() {
        let registry = InMemoryRegistry::new();
        registry.register(instance("a", "web", 8001)).unwrap();
        registry.register(instance("a", "api", 8001)).unwrap();

        assert!(registry.get_all_instances("web").is_empty());
        assert_eq!(registry.get_instance("a").unwrap().service, "api");
    }

    #[test]
    fn rejects_invalid_instances() {
        let registry = InMemoryRegistry::new();
        assert!(registry.register(instance("a", "web", 0)).is_err());
        assert!(registry.register(instance("a", "web", 8001).with_weight(0)).is_err());
    }

    #[test]
    fn to_backend_carries_status() {
        let backend = instance("a", "web", 8001)
            .with_status(ServiceStatus::Starting)
            .to_backend()
            .unwrap();
        assert!(!backend.is_healthy());
        assert_eq!(backend.address(), "127.0.0.1:8001");
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_removes_stale_instances() {
        let registry = InMemoryRegistry::new();
        registry.register(instance("a", "web", 8001)).unwrap();
        registry.register(instance("b", "web", 8002)).unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(registry.heartbeat("b"));
        tokio::time::advance(Duration::from_secs(20)).await;

        let removed = registry.cleanup_expired(Duration::from_secs(30));
        assert_eq!(removed, vec!["a".to_string()]);
        assert!(registry.get_instance("b").is_some());
    }
}
