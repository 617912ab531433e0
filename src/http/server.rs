//! HTTP server and proxy pipeline.
//!
//! # Responsibilities
//! - Create Axum Router with the proxy handler and the `/lb/*` status endpoints
//! - Wire up middleware (request ID, tracing, body limit, concurrency limit)
//! - Run each request through: route → rate limit → breaker → select →
//!   affinity override → forward → stats
//! - Take backends that refuse connections out of rotation

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::Request,
    response::{IntoResponse, Json, Response},
    routing::{any, get},
    Router,
};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower::ServiceBuilder;
use tower_http::{
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::config::{ListenerConfig, TimeoutConfig};
use crate::health::{mark_backend_down, HealthChecker, HealthStats};
use crate::http::request;
use crate::http::response::{self, ProxyError, ProxyStats, ProxyStatsSnapshot};
use crate::load_balancer::backend::BackendSnapshot;
use crate::load_balancer::pool::BackendManager;
use crate::load_balancer::BalancerStats;
use crate::observability::metrics;
use crate::resilience::circuit_breaker::{BreakerRegistry, CircuitBreakerStats};
use crate::routing::{Route, RouteTable, SessionManager, SessionStats};
use crate::security::{RateLimiter, RateLimiterStats};

/// The HTTP load balancing pipeline, independent of the server around it.
pub struct HttpProxy {
    routes: RouteTable,
    backends: Arc<BackendManager>,
    health: Arc<HealthChecker>,
    sessions: Arc<SessionManager>,
    limiter: Option<Arc<dyn RateLimiter>>,
    breakers: Option<Arc<BreakerRegistry>>,
    client: Client<HttpConnector, Body>,
    request_timeout: Duration,
    stats: ProxyStats,
}

impl std::fmt::Debug for HttpProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProxy")
            .field("routes", &self.routes.len())
            .field("rate_limited", &self.limiter.is_some())
            .field("circuit_breaking", &self.breakers.is_some())
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl HttpProxy {
    pub fn new(
        routes: RouteTable,
        backends: Arc<BackendManager>,
        health: Arc<HealthChecker>,
        sessions: Arc<SessionManager>,
        timeouts: &TimeoutConfig,
    ) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(Duration::from_secs(timeouts.connect_secs)));
        let client = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            routes,
            backends,
            health,
            sessions,
            limiter: None,
            breakers: None,
            client,
            request_timeout: Duration::from_secs(timeouts.request_secs),
            stats: ProxyStats::default(),
        }
    }

    pub fn with_rate_limiter(mut self, limiter: Option<Arc<dyn RateLimiter>>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Per-route circuit breakers; `None` disables circuit breaking.
    pub fn with_breakers(mut self, breakers: Option<Arc<BreakerRegistry>>) -> Self {
        self.breakers = breakers;
        self
    }

    /// Serve one client request.
    pub async fn handle(&self, request: Request<Body>, remote: SocketAddr) -> Result<Response, ProxyError> {
        let start = Instant::now();
        let method = request.method().to_string();
        self.stats.record_request();

        let result = self.forward(request, remote, start).await;
        match &result {
            Ok(_) => self.stats.record_success(start.elapsed()),
            Err(error) => {
                self.stats.record_failure(error);
                metrics::record_request(&method, error.status().as_u16(), "none", start);
                tracing::debug!(error = %error, "Request not proxied");
            }
        }
        result
    }

    async fn forward(&self, request: Request<Body>, remote: SocketAddr, start: Instant) -> Result<Response, ProxyError> {
        let path = request.uri().path().to_string();
        let method = request.method().to_string();
        let request_id = request::request_id(request.headers());
        let client_ip = request::client_ip(request.headers(), remote);

        let route = self
            .routes
            .match_path(&path)
            .ok_or_else(|| ProxyError::RouteNotFound { path: path.clone() })?;

        if let Some(limiter) = &self.limiter {
            if !limiter.allow_request(&client_ip) {
                metrics::record_rate_limited(limiter.kind());
                return Err(ProxyError::RateLimited);
            }
        }

        let breaker = self.breakers.as_ref().map(|r| r.get_or_create(route.name()));
        if let Some(breaker) = &breaker {
            if !breaker.can_execute() {
                return Err(ProxyError::CircuitOpen {
                    breaker: route.name().to_string(),
                });
            }
        }

        let balancer = route.balancer();
        let session_id = route
            .config
            .enable_session_affinity
            .then(|| self.sessions.session_id(request.headers(), &client_ip));
        let selected = balancer.next_backend(Some(&client_ip));
        let pinned = session_id
            .as_deref()
            .and_then(|id| self.sessions.get_backend_for_session(id, balancer.pool()));

        let Some(backend) = pinned.or(selected) else {
            if let Some(breaker) = &breaker {
                breaker.record_failure();
            }
            return Err(ProxyError::NoHealthyBackend {
                group: route.config.backend_group.clone(),
            });
        };

        tracing::debug!(
            request_id = %request_id,
            method = %method,
            path = %path,
            route = %route.name(),
            backend = %backend.id,
            client_ip = %client_ip,
            "Proxying request"
        );

        let _active = backend.connection_guard();
        let upstream = request::build_upstream_request(request, &backend, &route, &client_ip)?;
        let sent = Instant::now();
        let outcome = tokio::time::timeout(self.request_timeout, self.client.request(upstream)).await;
        let elapsed = sent.elapsed();

        let failed = |error: ProxyError| -> Result<Response, ProxyError> {
            if let Some(breaker) = &breaker {
                breaker.record_failure();
            }
            balancer.record_response(&backend, elapsed, false);
            Err(error)
        };

        match outcome {
            Ok(Ok(response)) => {
                if let Some(breaker) = &breaker {
                    breaker.record_success();
                }
                balancer.record_response(&backend, elapsed, true);
                if let Some(id) = &session_id {
                    self.sessions.bind_session(id, &backend);
                }
                metrics::record_request(&method, response.status().as_u16(), &backend.id, start);
                Ok(response::downstream_response(
                    response,
                    &backend.address(),
                    route.config.enable_cors,
                ))
            }
            Ok(Err(e)) if e.is_connect() => {
                mark_backend_down(&self.health, &backend);
                self.sessions.clear_sessions_for_backend(&backend.id);
                failed(ProxyError::BackendUnavailable {
                    backend: backend.address(),
                    reason: e.to_string(),
                })
            }
            Ok(Err(e)) => {
                tracing::warn!(request_id = %request_id, backend = %backend.id, error = %e, "Upstream error");
                failed(ProxyError::Upstream {
                    backend: backend.address(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                tracing::warn!(request_id = %request_id, backend = %backend.id, "Upstream timeout");
                failed(ProxyError::UpstreamTimeout {
                    backend: backend.address(),
                    timeout: self.request_timeout,
                })
            }
        }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn stats(&self) -> ProxyOverview {
        ProxyOverview {
            proxy: self.stats.snapshot(),
            routes: self.routes.routes().iter().map(|route| RouteStats::from(route.as_ref())).collect(),
            circuit_breakers: self.breakers.as_ref().map(|r| r.all_stats()).unwrap_or_default(),
            rate_limiter: self.limiter.as_ref().map(|l| l.stats()),
            sessions: self.sessions.stats(),
            health: self.health.stats(),
        }
    }

    pub fn backends(&self) -> Vec<BackendSnapshot> {
        let mut backends: Vec<BackendSnapshot> = self.backends.all_backends().iter().map(|b| b.snapshot()).collect();
        backends.sort_by(|a, b| a.id.cmp(&b.id));
        backends
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteStats {
    pub name: String,
    pub path: String,
    pub backend_group: String,
    pub balancer: BalancerStats,
}

impl From<&Route> for RouteStats {
    fn from(route: &Route) -> Self {
        Self {
            name: route.config.name.clone(),
            path: route.config.path.clone(),
            backend_group: route.config.backend_group.clone(),
            balancer: route.balancer().stats(),
        }
    }
}

/// Everything `/lb/stats` reports.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyOverview {
    pub proxy: ProxyStatsSnapshot,
    pub routes: Vec<RouteStats>,
    pub circuit_breakers: Vec<CircuitBreakerStats>,
    pub rate_limiter: Option<RateLimiterStats>,
    pub sessions: SessionStats,
    pub health: HealthStats,
}

/// HTTP server for the load balancer.
pub struct HttpServer {
    router: Router,
}

impl HttpServer {
    pub fn new(proxy: Arc<HttpProxy>, config: &ListenerConfig) -> Self {
        Self {
            router: Self::build_router(proxy, config),
        }
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(proxy: Arc<HttpProxy>, config: &ListenerConfig) -> Router {
        Router::new()
            .route("/lb/health", get(health_handler))
            .route("/lb/stats", get(stats_handler))
            .route("/lb/backends", get(backends_handler))
            .route("/{*path}", any(proxy_handler))
            .route("/", any(proxy_handler))
            .with_state(proxy)
            .layer(
                ServiceBuilder::new()
                    .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                    .layer(TraceLayer::new_for_http())
                    .layer(PropagateRequestIdLayer::x_request_id())
                    .layer(GlobalConcurrencyLimitLayer::new(config.max_connections.max(1)))
                    .layer(RequestBodyLimitLayer::new(config.max_body_size)),
            )
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Serve on `listener` until `shutdown` resolves.
    pub async fn run<F>(self, listener: TcpListener, shutdown: F) -> Result<(), std::io::Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

async fn proxy_handler(
    State(proxy): State<Arc<HttpProxy>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    match proxy.handle(request, remote).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    }
}

#[derive(Debug, Serialize)]
struct LbHealth {
    status: &'static str,
    routes: usize,
    healthy_backends: usize,
    timestamp: u64,
}

async fn health_handler(State(proxy): State<Arc<HttpProxy>>) -> Json<LbHealth> {
    Json(LbHealth {
        status: "healthy",
        routes: proxy.routes().len(),
        healthy_backends: proxy.backends().iter().filter(|b| b.healthy).count(),
        timestamp: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default(),
    })
}

async fn stats_handler(State(proxy): State<Arc<HttpProxy>>) -> Json<ProxyOverview> {
    Json(proxy.stats())
}

async fn backends_handler(State(proxy): State<Arc<HttpProxy>>) -> Json<Vec<BackendSnapshot>> {
    Json(proxy.backends())
}
