//! Raw TCP proxy.
//!
//! # Responsibilities
//! - Accept client connections up to `max_connections`
//! - Pick a backend per connection (client IP as the balancing key)
//! - Pump bytes both ways until EOF or error, counting them
//! - Close connections idle beyond `idle_timeout`
//!
//! # Design Decisions
//! - One task per connection, two copy loops joined inside it
//! - EOF on one side half-closes the other, so request/response protocols finish
//! - Shutdown stops accepting and closes every open connection

use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::{self, Instant};

use crate::config::TcpProxyConfig;
use crate::health::{mark_backend_down, HealthChecker};
use crate::load_balancer::backend::Backend;
use crate::load_balancer::Balancer;
use crate::net::connection::{Connection, ConnectionRegistry, ConnectionSnapshot, Direction};
use crate::net::listener::{ConnectionPermit, Listener, ListenerError};
use crate::observability::metrics;

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
    bytes_upstream: AtomicU64,
    bytes_downstream: AtomicU64,
}

/// TCP load balancing proxy.
#[derive(Debug)]
pub struct TcpProxy {
    config: TcpProxyConfig,
    balancer: Arc<Balancer>,
    health: Arc<HealthChecker>,
    connections: ConnectionRegistry,
    counters: Counters,
    running: AtomicBool,
}

impl TcpProxy {
    pub fn new(config: TcpProxyConfig, balancer: Arc<Balancer>, health: Arc<HealthChecker>) -> Self {
        Self {
            config,
            balancer,
            health,
            connections: ConnectionRegistry::new(),
            counters: Counters::default(),
            running: AtomicBool::new(false),
        }
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<Listener, ListenerError> {
        Listener::bind(&self.config.bind_address, self.config.max_connections).await
    }

    /// Accept connections until shutdown, then close the ones still open.
    pub async fn run(self: Arc<Self>, listener: Listener, mut shutdown: broadcast::Receiver<()>) {
        self.running.store(true, Ordering::Relaxed);
        tracing::info!(
            address = ?listener.local_addr().ok(),
            backends = self.balancer.pool().len(),
            "TCP proxy starting"
        );

        let sweep_interval = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        let mut sweep = time::interval_at(Instant::now() + sweep_interval, sweep_interval);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer, permit)) => {
                        let proxy = Arc::clone(&self);
                        tokio::spawn(async move {
                            proxy.handle(stream, peer, permit).await;
                        });
                    }
                    Err(ListenerError::AtCapacity { peer, max_connections }) => {
                        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                        metrics::record_tcp_connection("rejected");
                        tracing::warn!(peer = %peer, max_connections, "Max connections reached, rejecting");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "TCP accept failed");
                    }
                },
                _ = sweep.tick() => {
                    self.close_idle();
                }
                _ = shutdown.recv() => {
                    tracing::info!("TCP proxy received shutdown signal, exiting loop");
                    break;
                }
            }
        }

        drop(listener);
        self.connections.close_all();
        self.running.store(false, Ordering::Relaxed);
    }

    /// Close connections idle beyond the configured timeout.
    pub fn close_idle(&self) -> usize {
        let idle_timeout = Duration::from_secs(self.config.idle_timeout_secs);
        let closed = self.connections.close_idle(idle_timeout);
        for id in &closed {
            tracing::info!(connection_id = %id, "Closed idle connection");
        }
        closed.len()
    }

    async fn handle(&self, client: TcpStream, peer: SocketAddr, _permit: ConnectionPermit) {
        let client_ip = peer.ip().to_string();
        let Some(backend) = self.balancer.next_backend(Some(&client_ip)) else {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            metrics::record_tcp_connection("failed");
            tracing::warn!(peer = %peer, "No healthy backend available");
            return;
        };

        let connect_timeout = Duration::from_secs(self.config.connect_timeout_secs);
        let upstream = match time::timeout(connect_timeout, TcpStream::connect(backend.address())).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::debug!(backend = %backend.id, error = %e, "Backend connect failed");
                self.connect_failed(&backend);
                return;
            }
            Err(_) => {
                tracing::debug!(backend = %backend.id, "Backend connect timed out");
                self.connect_failed(&backend);
                return;
            }
        };

        let _active = backend.connection_guard();
        let guard = self.connections.register(peer, backend.id.clone());
        let connection = Arc::clone(guard.connection());
        self.counters.total.fetch_add(1, Ordering::Relaxed);
        metrics::record_tcp_connection("accepted");
        tracing::info!(
            connection_id = %connection.id,
            peer = %peer,
            backend = %backend.address(),
            "New connection proxied"
        );

        let started = Instant::now();
        let (client_read, client_write) = client.into_split();
        let (upstream_read, upstream_write) = upstream.into_split();
        let buffer_size = self.config.buffer_size.max(1);

        let pumps = async {
            tokio::join!(
                pump(client_read, upstream_write, &connection, Direction::Upstream, buffer_size),
                pump(upstream_read, client_write, &connection, Direction::Downstream, buffer_size),
            )
        };

        tokio::select! {
            (up, down) = pumps => {
                if let Err(e) = up.and(down) {
                    tracing::debug!(connection_id = %connection.id, error = %e, "Connection ended with error");
                }
            }
            _ = connection.closed() => {
                tracing::debug!(connection_id = %connection.id, "Connection closed by proxy");
            }
        }

        let up = connection.bytes(Direction::Upstream);
        let down = connection.bytes(Direction::Downstream);
        self.counters.bytes_upstream.fetch_add(up, Ordering::Relaxed);
        self.counters.bytes_downstream.fetch_add(down, Ordering::Relaxed);
        metrics::record_tcp_bytes(Direction::Upstream.as_str(), up);
        metrics::record_tcp_bytes(Direction::Downstream.as_str(), down);
        tracing::debug!(
            connection_id = %connection.id,
            bytes_upstream = up,
            bytes_downstream = down,
            duration_ms = started.elapsed().as_millis() as u64,
            "Connection finished"
        );
    }

    fn connect_failed(&self, backend: &Backend) {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        metrics::record_tcp_connection("failed");
        backend.mark_error();
        mark_backend_down(&self.health, backend);
    }

    pub fn balancer(&self) -> &Arc<Balancer> {
        &self.balancer
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn connections(&self) -> Vec<ConnectionSnapshot> {
        self.connections.snapshot()
    }

    pub fn stats(&self) -> TcpProxyStats {
        TcpProxyStats {
            bind_address: self.config.bind_address.clone(),
            running: self.is_running(),
            algorithm: self.balancer.algorithm(),
            total_connections: self.counters.total.load(Ordering::Relaxed),
            active_connections: self.connections.active_count(),
            rejected_connections: self.counters.rejected.load(Ordering::Relaxed),
            failed_connections: self.counters.failed.load(Ordering::Relaxed),
            total_bytes_upstream: self.counters.bytes_upstream.load(Ordering::Relaxed),
            total_bytes_downstream: self.counters.bytes_downstream.load(Ordering::Relaxed),
            max_connections: self.config.max_connections,
            idle_timeout_secs: self.config.idle_timeout_secs,
            buffer_size: self.config.buffer_size,
        }
    }
}

/// Copy `from` into `to` until EOF, then half-close `to`.
async fn pump(
    mut from: OwnedReadHalf,
    mut to: OwnedWriteHalf,
    connection: &Connection,
    direction: Direction,
    buffer_size: usize,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = from.read(&mut buf).await?;
        if n == 0 {
            to.shutdown().await?;
            return Ok(());
        }
        to.write_all(&buf[..n]).await?;
        connection.record_transfer(direction, n as u64);
    }
}

/// Totals exclude bytes of connections still open.
#[derive(Debug, Clone, Serialize)]
pub struct TcpProxyStats {
    pub bind_address: String,
    pub running: bool,
    pub algorithm: &'static str,
    pub total_connections: u64,
    pub active_connections: usize,
    pub rejected_connections: u64,
    pub failed_connections: u64,
    pub total_bytes_upstream: u64,
    pub total_bytes_downstream: u64,
    pub max_connections: usize,
    pub idle_timeout_secs: u64,
    pub buffer_size: usize,
}
