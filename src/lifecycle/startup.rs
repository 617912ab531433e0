//! Startup orchestration.
//!
//! # Responsibilities
//! - Initialize all subsystems from a validated config, in dependency order
//! - Start background tasks (health checks, session sweep, limiter cleanup,
//!   registry watch, instance expiry)
//! - Hand out the HTTP and TCP front ends
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Listeners start last (traffic only when ready)
//! - Every background task stops on the shared shutdown signal
//! - Backends from the config file never expire; only runtime registrations do
//! - Pool sync also hands new registry instances to the health checker

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;

use crate::config::ProxyConfig;
use crate::discovery::{InMemoryRegistry, RegistryError, ServiceInstance, ServiceRegistry, ServiceWatcher};
use crate::health::{HealthChecker, HealthListener};
use crate::http::HttpProxy;
use crate::lifecycle::Shutdown;
use crate::load_balancer::pool::{BackendManager, BackendPool};
use crate::load_balancer::BalancerError;
use crate::net::TcpProxy;
use crate::resilience::BreakerRegistry;
use crate::routing::{RouteError, RouteTable, SessionManager};
use crate::security::{rate_limit, RateLimiter};

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("failed to register backend: {0}")]
    Registry(#[from] RegistryError),

    #[error("failed to build backend groups: {0}")]
    Backends(#[from] BalancerError),

    #[error("failed to build routes: {0}")]
    Routes(#[from] RouteError),

    #[error("tcp proxy backend group '{0}' does not exist")]
    UnknownTcpGroup(String),
}

/// Every long-lived part of a running balancer.
#[derive(Debug)]
pub struct Components {
    pub config: ProxyConfig,
    pub registry: Arc<dyn ServiceRegistry>,
    pub backends: Arc<BackendManager>,
    pub health: Arc<HealthChecker>,
    pub sessions: Arc<SessionManager>,
    pub watcher: Arc<ServiceWatcher>,
    limiter: Option<Arc<dyn RateLimiter>>,
    http: Arc<HttpProxy>,
    tcp: Option<Arc<TcpProxy>>,
}

impl Components {
    pub fn build(config: ProxyConfig) -> Result<Self, StartupError> {
        let registry: Arc<dyn ServiceRegistry> = Arc::new(InMemoryRegistry::new());
        for backend in &config.backends {
            registry.register(ServiceInstance::from(backend))?;
        }

        let backends = Arc::new(BackendManager::new(&config.backends, &config.balancer)?);

        let health = Arc::new(HealthChecker::new(Arc::clone(&registry), &config.health_check));
        for backend in &config.backends {
            health.add_instance(&ServiceInstance::from(backend));
        }
        health.add_listener(Arc::clone(&backends) as Arc<dyn HealthListener>);

        let sessions = Arc::new(SessionManager::new(&config.session));
        let routes = RouteTable::from_config(&config.routes, &backends, &config.balancer)?;
        tracing::info!(routes = routes.len(), "Route table ready");

        let breakers = config
            .circuit_breaker
            .enabled
            .then(|| Arc::new(BreakerRegistry::new(config.circuit_breaker.clone())));

        let limiter = rate_limit::from_config(&config.rate_limit);
        let http = HttpProxy::new(
            routes,
            Arc::clone(&backends),
            Arc::clone(&health),
            Arc::clone(&sessions),
            &config.timeouts,
        )
        .with_rate_limiter(limiter.clone())
        .with_breakers(breakers);

        let tcp = if config.tcp.enabled {
            let balancer = backends
                .group(&config.tcp.backend_group)
                .ok_or_else(|| StartupError::UnknownTcpGroup(config.tcp.backend_group.clone()))?;
            Some(Arc::new(TcpProxy::new(config.tcp.clone(), balancer, Arc::clone(&health))))
        } else {
            None
        };

        let watcher = Arc::new(ServiceWatcher::new(
            Arc::clone(&registry),
            Duration::from_secs(config.discovery.watch_interval_secs.max(1)),
        ));

        Ok(Self {
            config,
            registry,
            backends,
            health,
            sessions,
            watcher,
            limiter,
            http: Arc::new(http),
            tcp,
        })
    }

    pub fn http_proxy(&self) -> Arc<HttpProxy> {
        Arc::clone(&self.http)
    }

    pub fn tcp_proxy(&self) -> Option<Arc<TcpProxy>> {
        self.tcp.clone()
    }

    /// Start every background loop. Each one exits on `shutdown`.
    pub fn spawn_background(&self, shutdown: &Shutdown) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        if self.config.health_check.enabled {
            tasks.push(tokio::spawn(Arc::clone(&self.health).run(shutdown.subscribe())));
        }

        tasks.push(tokio::spawn(Arc::clone(&self.sessions).run_sweeper(shutdown.subscribe())));

        if let Some(limiter) = &self.limiter {
            let config = &self.config.rate_limit;
            tasks.push(tokio::spawn(rate_limit::run_cleanup(
                Arc::clone(limiter),
                Duration::from_secs(config.cleanup_interval_secs.max(1)),
                Duration::from_secs(config.key_idle_secs.max(1)),
                shutdown.subscribe(),
            )));
        }

        if self.config.discovery.instance_ttl_secs > 0 {
            let pinned = self.config.backends.iter().map(|b| b.id.clone()).collect();
            tasks.push(tokio::spawn(expire_instances(
                Arc::clone(&self.registry),
                Arc::clone(&self.health),
                pinned,
                Duration::from_secs(self.config.discovery.instance_ttl_secs),
                shutdown.subscribe(),
            )));
        }

        if self.config.discovery.watch_enabled {
            let groups: Vec<String> = self.backends.group_names().map(str::to_string).collect();
            for group in groups {
                if let Some(pool) = self.backends.pool(&group) {
                    tasks.push(tokio::spawn(sync_pool(
                        Arc::clone(&self.watcher),
                        Arc::clone(&self.registry),
                        Arc::clone(&self.health),
                        group,
                        pool,
                        shutdown.subscribe(),
                    )));
                }
            }
            tasks.push(tokio::spawn(Arc::clone(&self.watcher).run(shutdown.subscribe())));
        }

        tasks
    }
}

/// Keep `pool` in step with the registry's view of `group`.
///
/// The watch channel signals a change; membership is then taken from every
/// registered instance so unhealthy members stay visible, flagged unhealthy.
/// Members joining or leaving the pool join or leave health checking too.
async fn sync_pool(
    watcher: Arc<ServiceWatcher>,
    registry: Arc<dyn ServiceRegistry>,
    health: Arc<HealthChecker>,
    group: String,
    pool: Arc<BackendPool>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut changes = watcher.watch(&group);
    changes.borrow_and_update();
    resync(registry.as_ref(), &health, &group, &pool);

    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                changes.borrow_and_update();
                resync(registry.as_ref(), &health, &group, &pool);
            }
            _ = shutdown.recv() => break,
        }
    }
}

fn resync(registry: &dyn ServiceRegistry, health: &HealthChecker, group: &str, pool: &BackendPool) {
    let instances = registry.get_all_instances(group);

    let mut backends = Vec::with_capacity(instances.len());
    for instance in &instances {
        match instance.to_backend() {
            Ok(backend) => {
                if health.add_instance(instance) {
                    tracing::info!(instance = %instance.id, group = %group, "Health checking new instance");
                }
                backends.push(backend);
            }
            Err(e) => tracing::warn!(instance = %instance.id, error = %e, "Skipping invalid instance"),
        }
    }

    for gone in pool.all().iter().filter(|b| !backends.iter().any(|n| n.id == b.id)) {
        if health.remove_instance(&gone.id) {
            tracing::info!(instance = %gone.id, group = %group, "Stopped health checking departed instance");
        }
    }

    if pool.sync(backends) {
        tracing::info!(group = %group, backends = pool.len(), "Backend pool updated");
    }
}

/// Deregister instances that stopped sending heartbeats.
///
/// `pinned` instances come from the config file. They are kept alive here so
/// a long outage leaves them registered, probed and able to recover.
async fn expire_instances(
    registry: Arc<dyn ServiceRegistry>,
    health: Arc<HealthChecker>,
    pinned: HashSet<String>,
    ttl: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = time::interval(ttl);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for id in &pinned {
                    registry.heartbeat(id);
                }
                for id in registry.cleanup_expired(ttl) {
                    health.remove_instance(&id);
                    tracing::info!(instance = %id, "Expired instance removed");
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}
