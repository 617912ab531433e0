//! Active and passive health checking.
//!
//! # Responsibilities
//! - Periodically probe registered instances, concurrently and each under a timeout
//! - Apply consecutive success/failure thresholds
//! - Push transitions to the registry and to listeners

use futures_util::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;

use crate::config::{HealthCheckConfig, ProbeKind};
use crate::discovery::{ServiceInstance, ServiceRegistry, ServiceStatus};
use crate::health::{HealthListener, Prober};
use crate::lifecycle::Shutdown;
use crate::observability::metrics;

#[derive(Debug, Clone)]
struct Target {
    host: String,
    port: u16,
    healthy: bool,
    consecutive_successes: u32,
    consecutive_failures: u32,
}

pub struct HealthChecker {
    registry: Arc<dyn ServiceRegistry>,
    prober: Prober,
    interval: Duration,
    timeout: Duration,
    healthy_threshold: u32,
    unhealthy_threshold: u32,
    targets: Mutex<HashMap<String, Target>>,
    listeners: RwLock<Vec<Arc<dyn HealthListener>>>,
    running: AtomicBool,
    shutdown: Shutdown,
}

impl std::fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthChecker")
            .field("prober", &self.prober)
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl HealthChecker {
    pub fn new(registry: Arc<dyn ServiceRegistry>, config: &HealthCheckConfig) -> Self {
        Self {
            registry,
            prober: Prober::new(config.kind, config.path.clone()),
            interval: Duration::from_secs(config.interval_secs.max(1)),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
            healthy_threshold: config.healthy_threshold.max(1),
            unhealthy_threshold: config.unhealthy_threshold.max(1),
            targets: Mutex::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            running: AtomicBool::new(false),
            shutdown: Shutdown::new(),
        }
    }

    /// Track an instance. New instances start healthy.
    ///
    /// An instance already tracked at the same address keeps its state.
    /// Returns true if the instance was newly tracked.
    pub fn add_instance(&self, instance: &ServiceInstance) -> bool {
        let mut targets = self.targets();
        if targets
            .get(&instance.id)
            .is_some_and(|t| t.host == instance.host && t.port == instance.port)
        {
            return false;
        }
        targets.insert(
            instance.id.clone(),
            Target {
                host: instance.host.clone(),
                port: instance.port,
                healthy: true,
                consecutive_successes: 0,
                consecutive_failures: 0,
            },
        );
        tracing::debug!(instance = %instance.id, address = %instance.address(), "Health tracking instance");
        true
    }

    pub fn remove_instance(&self, instance_id: &str) -> bool {
        self.targets().remove(instance_id).is_some()
    }

    /// Health of a tracked instance; false for unknown ids.
    pub fn is_healthy(&self, instance_id: &str) -> bool {
        self.targets().get(instance_id).is_some_and(|t| t.healthy)
    }

    pub fn add_listener(&self, listener: Arc<dyn HealthListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Feed an outcome observed outside the probe loop (passive check).
    pub fn report(&self, instance_id: &str, healthy: bool) {
        self.apply(instance_id, healthy, false);
    }

    /// Mark an instance unhealthy now, regardless of the failure threshold.
    /// Probes bring it back. Returns false for untracked ids.
    pub fn mark_unhealthy(&self, instance_id: &str) -> bool {
        if !self.targets().contains_key(instance_id) {
            return false;
        }
        self.apply(instance_id, false, true);
        true
    }

    /// Probe every tracked instance once, concurrently.
    pub async fn check_now(&self) {
        let targets: Vec<(String, String, u16)> = self
            .targets()
            .iter()
            .map(|(id, t)| (id.clone(), t.host.clone(), t.port))
            .collect();

        let probes = targets.into_iter().map(|(id, host, port)| async move {
            let healthy = match time::timeout(self.timeout, self.prober.probe(&host, port)).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::debug!(instance = %id, "Health check failed: timeout");
                    false
                }
            };
            (id, healthy)
        });

        for (id, healthy) in join_all(probes).await {
            self.apply(&id, healthy, false);
        }
    }

    /// Run the probe loop until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            kind = ?self.prober.kind(),
            "Health checker starting"
        );
        self.running.store(true, Ordering::Relaxed);

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_now().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Health checker received shutdown signal, exiting loop");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::Relaxed);
    }

    /// Spawn the probe loop, stoppable with [`HealthChecker::stop`].
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(Arc::clone(self).run(shutdown))
    }

    pub fn stop(&self) {
        self.shutdown.trigger();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> HealthStats {
        let targets = self.targets();
        let healthy = targets.values().filter(|t| t.healthy).count();
        HealthStats {
            total: targets.len(),
            healthy,
            unhealthy: targets.len() - healthy,
            kind: self.prober.kind(),
            interval_secs: self.interval.as_secs(),
            running: self.is_running(),
        }
    }

    /// Apply one observation; returns the new state if it flipped.
    fn apply(&self, instance_id: &str, healthy: bool, force: bool) -> Option<bool> {
        let transition = {
            let mut targets = self.targets();
            let target = targets.get_mut(instance_id)?;
            if healthy {
                target.consecutive_failures = 0;
                target.consecutive_successes = target.consecutive_successes.saturating_add(1);
                (!target.healthy && target.consecutive_successes >= self.healthy_threshold).then(|| {
                    target.healthy = true;
                    true
                })
            } else {
                target.consecutive_successes = 0;
                target.consecutive_failures = target.consecutive_failures.saturating_add(1);
                (target.healthy && (force || target.consecutive_failures >= self.unhealthy_threshold)).then(|| {
                    target.healthy = false;
                    false
                })
            }
        };

        if healthy {
            self.registry.heartbeat(instance_id);
        }

        let now_healthy = transition?;
        let status = if now_healthy {
            ServiceStatus::Healthy
        } else {
            ServiceStatus::Unhealthy
        };
        self.registry.update_instance_status(instance_id, status);
        metrics::record_backend_health(instance_id, now_healthy);
        if now_healthy {
            tracing::info!(instance = %instance_id, "Instance became healthy");
        } else {
            tracing::warn!(instance = %instance_id, "Instance became unhealthy");
        }

        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener.on_health_change(instance_id, now_healthy);
        }
        Some(now_healthy)
    }

    fn targets(&self) -> MutexGuard<'_, HashMap<String, Target>> {
        self.targets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStats {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub kind: ProbeKind,
    pub interval_secs: u64,
    pub running: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::InMemoryRegistry;
    use std::sync::Mutex as StdMutex;

    fn checker(healthy_threshold: u32, unhealthy_threshold: u32) -> (Arc<InMemoryRegistry>, HealthChecker) {
        let registry = Arc::new(InMemoryRegistry::new());
        let config = HealthCheckConfig {
            kind: ProbeKind::Tcp,
            healthy_threshold,
            unhealthy_threshold,
            ..HealthCheckConfig::default()
        };
        let checker = HealthChecker::new(registry.clone(), &config);
        (registry, checker)
    }

    #[test]
    fn thresholds_gate_transitions_and_notify() {
        let (registry, checker) = checker(2, 2);
        let instance = ServiceInstance::new("web", "127.0.0.1", 1).with_id("a");
        registry.register(instance.clone()).unwrap();
        checker.add_instance(&instance);

        let events: Arc<StdMutex<Vec<(String, bool)>>> = Arc::default();
        let sink = Arc::clone(&events);
        checker.add_listener(Arc::new(move |id: &str, healthy: bool| {
            sink.lock().unwrap().push((id.to_string(), healthy));
        }));

        assert!(checker.is_healthy("a"));
        assert!(!checker.is_healthy("unknown"));

        checker.report("a", false);
        assert!(checker.is_healthy("a"));
        checker.report("a", false);
        assert!(!checker.is_healthy("a"));
        assert_eq!(registry.get_instance("a").unwrap().status, ServiceStatus::Unhealthy);

        checker.report("a", true);
        checker.report("a", true);
        assert!(checker.is_healthy("a"));
        assert_eq!(registry.get_instance("a").unwrap().status, ServiceStatus::Healthy);

        assert_eq!(
            *events.lock().unwrap(),
            vec![("a".to_string(), false), ("a".to_string(), true)]
        );
        assert_eq!(checker.stats().healthy, 1);

        assert!(checker.mark_unhealthy("a"));
        assert!(!checker.is_healthy("a"));
        assert!(!checker.mark_unhealthy("unknown"));
    }

    #[test]
    fn re_adding_an_instance_keeps_its_state() {
        let (registry, checker) = checker(1, 1);
        let instance = ServiceInstance::new("web", "127.0.0.1", 1).with_id("a");
        registry.register(instance.clone()).unwrap();
        assert!(checker.add_instance(&instance));

        checker.report("a", false);
        assert!(!checker.add_instance(&instance));
        assert!(!checker.is_healthy("a"));

        let moved = ServiceInstance::new("web", "127.0.0.1", 2).with_id("a");
        assert!(checker.add_instance(&moved));
        assert!(checker.is_healthy("a"));
        assert_eq!(checker.stats().total, 1);
    }

    #[tokio::test]
    async fn tcp_probe_marks_closed_port_unhealthy() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open_port = listener.local_addr().unwrap().port();
        let closed_port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };

        let (registry, checker) = checker(1, 1);
        for (id, port) in [("up", open_port), ("down", closed_port)] {
            let instance = ServiceInstance::new("svc", "127.0.0.1", port).with_id(id);
            registry.register(instance.clone()).unwrap();
            checker.add_instance(&instance);
        }

        checker.check_now().await;
        assert!(checker.is_healthy("up"));
        assert!(!checker.is_healthy("down"));
        assert_eq!(registry.discover("svc").len(), 1);

        assert!(checker.remove_instance("down"));
        assert_eq!(checker.stats().total, 1);
    }

    #[tokio::test]
    async fn start_and_stop() {
        let (_registry, checker) = checker(1, 1);
        let checker = Arc::new(checker);
        let handle = checker.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(checker.is_running());
        checker.stop();
        handle.await.unwrap();
        assert!(!checker.is_running());
    }
}
