//! Registry watcher.
//!
//! Periodically fingerprints each watched service's instances by
//! (id, host, port, status, weight). When the fingerprint changes, the service's
//! current HEALTHY instances are published on a `watch` channel.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time;

use crate::discovery::registry::{ServiceInstance, ServiceRegistry, ServiceStatus};

type Fingerprint = Vec<(String, String, u16, ServiceStatus, u32)>;

#[derive(Debug)]
struct Watched {
    fingerprint: Fingerprint,
    tx: watch::Sender<Vec<ServiceInstance>>,
}

fn fingerprint(instances: &[ServiceInstance]) -> Fingerprint {
    let mut fp: Fingerprint = instances
        .iter()
        .map(|i| (i.id.clone(), i.host.clone(), i.port, i.status, i.weight))
        .collect();
    fp.sort();
    fp
}

/// Publishes topology changes of registry services.
#[derive(Debug)]
pub struct ServiceWatcher {
    registry: Arc<dyn ServiceRegistry>,
    interval: Duration,
    watched: Mutex<HashMap<String, Watched>>,
    checks: AtomicU64,
    changes: AtomicU64,
}

impl ServiceWatcher {
    pub fn new(registry: Arc<dyn ServiceRegistry>, interval: Duration) -> Self {
        Self {
            registry,
            interval,
            watched: Mutex::new(HashMap::new()),
            checks: AtomicU64::new(0),
            changes: AtomicU64::new(0),
        }
    }

    /// Subscribe to a service. The receiver starts with the current healthy set.
    pub fn watch(&self, service: &str) -> watch::Receiver<Vec<ServiceInstance>> {
        let mut watched = self.lock();
        if let Some(existing) = watched.get(service) {
            return existing.tx.subscribe();
        }

        let all = self.registry.get_all_instances(service);
        let (tx, rx) = watch::channel(self.registry.discover(service));
        watched.insert(
            service.to_string(),
            Watched {
                fingerprint: fingerprint(&all),
                tx,
            },
        );
        tracing::debug!(service = %service, "Watching service");
        rx
    }

    /// Stop watching a service; its receivers observe the sender closing.
    pub fn unwatch(&self, service: &str) -> bool {
        self.lock().remove(service).is_some()
    }

    pub fn watched_services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Diff every watched service once. Returns the services that changed.
    pub fn check_changes(&self) -> Vec<String> {
        self.checks.fetch_add(1, Ordering::Relaxed);
        let mut changed = Vec::new();
        let mut watched = self.lock();
        for (service, entry) in watched.iter_mut() {
            let current = fingerprint(&self.registry.get_all_instances(service));
            if current == entry.fingerprint {
                continue;
            }
            entry.fingerprint = current;
            // send_replace never fails, even without receivers
            entry.tx.send_replace(self.registry.discover(service));
            changed.push(service.clone());
        }
        drop(watched);

        if !changed.is_empty() {
            self.changes.fetch_add(changed.len() as u64, Ordering::Relaxed);
            tracing::info!(services = ?changed, "Service topology changed");
        }
        changed
    }

    /// Run the polling loop until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(interval_secs = self.interval.as_secs(), "Service watcher starting");
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_changes();
                }
                _ = shutdown.recv() => {
                    tracing::info!("Service watcher received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    pub fn stats(&self) -> WatcherStats {
        WatcherStats {
            watched_services: self.watched_services(),
            interval_secs: self.interval.as_secs(),
            checks: self.checks.load(Ordering::Relaxed),
            changes: self.changes.load(Ordering::Relaxed),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Watched>> {
        self.watched.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WatcherStats {
    pub watched_services: Vec<String>,
    pub interval_secs: u64,
    pub checks: u64,
    pub changes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::registry::InMemoryRegistry;

    fn setup() -> (Arc<InMemoryRegistry>, ServiceWatcher) {
        let registry = Arc::new(InMemoryRegistry::new());
        registry
            .register(ServiceInstance::new("web", "127.0.0.1", 8001).with_id("a"))
            .unwrap();
        let watcher = ServiceWatcher::new(registry.clone(), Duration::from_secs(1));
        (registry, watcher)
    }

    #[test]
    fn publishes_healthy_set_on_change() {
        let (registry, watcher) = setup();
        let mut rx = watcher.watch("web");
        assert_eq!(rx.borrow_and_update().len(), 1);

        assert!(watcher.check_changes().is_empty());
        assert!(!rx.has_changed().unwrap());

        registry
            .register(ServiceInstance::new("web", "127.0.0.1", 8002).with_id("b"))
            .unwrap();
        assert_eq!(watcher.check_changes(), vec!["web".to_string()]);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().len(), 2);

        registry.update_instance_status("a", ServiceStatus::Unhealthy);
        watcher.check_changes();
        let healthy = rx.borrow_and_update().clone();
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].id, "b");
        assert_eq!(watcher.stats().changes, 2);
    }

    #[test]
    fn heartbeat_alone_is_not_a_change() {
        let (registry, watcher) = setup();
        let _rx = watcher.watch("web");
        registry.heartbeat("a");
        assert!(watcher.check_changes().is_empty());
        assert!(watcher.unwatch("web"));
        assert!(watcher.watched_services().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown() {
        let (_registry, watcher) = setup();
        let watcher = Arc::new(watcher);
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(Arc::clone(&watcher).run(rx));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        tx.send(()).unwrap();
        handle.await.unwrap();
        assert!(watcher.stats().checks >= 2);
    }
}
