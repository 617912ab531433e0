//! Shared utilities for integration tests.

#![allow(dead_code)]

use axum::{
    extract::Request,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use balancing_proxy::config::{BackendConfig, ProxyConfig};
use balancing_proxy::{Components, HttpServer, Shutdown};

/// Start a mock HTTP backend that answers every path with its own name.
///
/// Responses carry the path it saw in `x-seen-path` and the forwarded client
/// address in `x-seen-forwarded-for`. `/health` answers 200.
pub async fn start_mock_backend(name: &'static str) -> SocketAddr {
    start_mock_backend_at(name, "127.0.0.1:0".parse().unwrap()).await
}

/// Same as [`start_mock_backend`], on a fixed address.
pub async fn start_mock_backend_at(name: &'static str, addr: SocketAddr) -> SocketAddr {
    let listener = TcpListener::bind(addr).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .fallback(move |request: Request| async move { echo(name, request) });

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn echo(name: &'static str, request: Request) -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    headers.insert("x-seen-path", request.uri().path().parse().unwrap());
    if let Some(xff) = request.headers().get("x-forwarded-for") {
        headers.insert("x-seen-forwarded-for", xff.clone());
    }
    if let Some(value) = request.headers().get("x-service") {
        headers.insert("x-seen-service", value.clone());
    }
    (StatusCode::OK, headers, name)
}

/// Start a TCP server that echoes every byte back.
pub async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// An address nothing listens on.
pub async fn dead_address() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

pub fn backend(id: &str, group: &str, addr: SocketAddr) -> BackendConfig {
    BackendConfig::new(id, group, addr.ip().to_string(), addr.port())
}

/// Config with health checks off, so tests control health themselves.
pub fn base_config() -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.health_check.enabled = false;
    config.discovery.watch_enabled = false;
    config
}

/// A running balancer on an ephemeral port.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub components: Components,
    pub shutdown: Shutdown,
}

impl TestProxy {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

pub async fn start_proxy(config: ProxyConfig) -> TestProxy {
    let components = Components::build(config).unwrap();
    let shutdown = Shutdown::new();
    components.spawn_background(&shutdown);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = HttpServer::new(components.http_proxy(), &components.config.listener);
    let signalled = shutdown.signalled();
    tokio::spawn(async move {
        server.run(listener, signalled).await.unwrap();
    });

    TestProxy {
        addr,
        components,
        shutdown,
    }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .pool_max_idle_per_host(0)
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

/// Poll `condition` every 50ms for up to `limit`.
pub async fn eventually(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}
