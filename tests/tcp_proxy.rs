//! End-to-end tests of the raw TCP proxy.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use balancing_proxy::config::ProxyConfig;
use balancing_proxy::{Components, Shutdown, TcpProxy};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

mod common;

struct RunningTcp {
    addr: SocketAddr,
    proxy: Arc<TcpProxy>,
    shutdown: Shutdown,
    _components: Components,
}

async fn start(mut config: ProxyConfig, backends: &[SocketAddr]) -> RunningTcp {
    for (i, addr) in backends.iter().enumerate() {
        config.backends.push(common::backend(&format!("t{}", i), "db", *addr));
    }
    config.tcp.enabled = true;
    config.tcp.bind_address = "127.0.0.1:0".to_string();
    config.tcp.backend_group = "db".to_string();

    let components = Components::build(config).unwrap();
    let proxy = components.tcp_proxy().unwrap();
    let listener = proxy.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Shutdown::new();
    tokio::spawn(Arc::clone(&proxy).run(listener, shutdown.subscribe()));

    RunningTcp {
        addr,
        proxy,
        shutdown,
        _components: components,
    }
}

#[tokio::test]
async fn relays_bytes_both_ways_and_counts_them() {
    let echo = common::start_echo_server().await;
    let tcp = start(common::base_config(), &[echo]).await;

    let mut client = TcpStream::connect(tcp.addr).await.unwrap();
    client.write_all(b"hello backend").await.unwrap();
    let mut buf = [0u8; 13];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello backend");

    client.shutdown().await.unwrap();
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    let proxy = Arc::clone(&tcp.proxy);
    assert!(
        common::eventually(Duration::from_secs(2), || {
            let stats = proxy.stats();
            stats.active_connections == 0 && stats.total_bytes_upstream == 13
        })
        .await
    );
    let stats = tcp.proxy.stats();
    assert!(stats.running);
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.total_bytes_downstream, 13);
}

#[tokio::test]
async fn refuses_connections_over_capacity() {
    let echo = common::start_echo_server().await;
    let mut config = common::base_config();
    config.tcp.max_connections = 1;
    let tcp = start(config, &[echo]).await;

    let mut first = TcpStream::connect(tcp.addr).await.unwrap();
    first.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    first.read_exact(&mut buf).await.unwrap();

    let mut second = TcpStream::connect(tcp.addr).await.unwrap();
    let mut byte = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(2), second.read(&mut byte))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    let proxy = Arc::clone(&tcp.proxy);
    assert!(common::eventually(Duration::from_secs(1), || proxy.stats().rejected_connections == 1).await);

    first.write_all(b"pong").await.unwrap();
    first.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");
}

#[tokio::test]
async fn idle_connections_are_closed() {
    let echo = common::start_echo_server().await;
    let mut config = common::base_config();
    config.tcp.idle_timeout_secs = 1;
    config.tcp.sweep_interval_secs = 1;
    let tcp = start(config, &[echo]).await;

    let mut client = TcpStream::connect(tcp.addr).await.unwrap();
    client.write_all(b"x").await.unwrap();
    let mut buf = [0u8; 1];
    client.read_exact(&mut buf).await.unwrap();

    let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
    assert!(common::eventually(Duration::from_secs(1), || tcp.proxy.connections().is_empty()).await);
}

#[tokio::test]
async fn shutdown_closes_open_connections() {
    let echo = common::start_echo_server().await;
    let tcp = start(common::base_config(), &[echo]).await;

    let mut client = TcpStream::connect(tcp.addr).await.unwrap();
    client.write_all(b"x").await.unwrap();
    let mut buf = [0u8; 1];
    client.read_exact(&mut buf).await.unwrap();

    tcp.shutdown.trigger();
    let read = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    let proxy = Arc::clone(&tcp.proxy);
    assert!(common::eventually(Duration::from_secs(1), || !proxy.is_running()).await);
}

#[tokio::test]
async fn unreachable_backend_is_marked_down() {
    let dead = common::dead_address().await;
    let echo = common::start_echo_server().await;
    let tcp = start(common::base_config(), &[dead, echo]).await;

    // Round robin sends the two attempts to different backends.
    let mut answered = 0;
    for _ in 0..2 {
        let mut client = TcpStream::connect(tcp.addr).await.unwrap();
        let _ = client.write_all(b"hi").await;
        let mut buf = [0u8; 2];
        if let Ok(Ok(_)) = tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut buf)).await {
            answered += 1;
        }
    }
    assert_eq!(answered, 1);

    let stats = tcp.proxy.stats();
    assert_eq!(stats.failed_connections, 1);
    let dead_backend = tcp.proxy.balancer().pool().get("t0").unwrap();
    assert!(!dead_backend.is_healthy());
}
