//! Balancing proxy
//!
//! A software load balancer built with Tokio and Axum.
//!
//! # Architecture Overview
//!
//! ```text
//!                              ┌──────────────────────────────────────────────────────────┐
//!                              │                     LOAD BALANCER                         │
//!                              │                                                           │
//!     Client Request           │  ┌─────────┐    ┌─────────┐    ┌──────────────┐          │
//!     ─────────────────────────┼─▶│  http   │───▶│ routing │───▶│ rate limit + │          │
//!                              │  │ server  │    │  table  │    │   breaker    │          │
//!                              │  └─────────┘    └─────────┘    └──────┬───────┘          │
//!                              │                                       ▼                   │
//!                              │                 ┌─────────┐    ┌──────────────┐          │
//!                              │                 │ session │───▶│load_balancer │          │
//!                              │                 │affinity │    │ strategy+pool│          │
//!                              │                 └─────────┘    └──────┬───────┘          │
//!                              │                                       ▼                   │
//!     Client Response          │  ┌─────────┐    ┌─────────┐    ┌──────────────┐          │
//!     ◀────────────────────────┼──│response │◀───│ hyper   │◀───│   backend    │◀─────────┼──── Backend
//!                              │  │ headers │    │ client  │    │              │          │     Server
//!                              │  └─────────┘    └─────────┘    └──────────────┘          │
//!                              │                                                           │
//!     TCP client ──────────────┼─▶ net::tcp_proxy ──▶ load_balancer ──▶ byte pumps ───────┼──── Backend
//!                              │                                                           │
//!                              │  ┌─────────────────────────────────────────────────────┐ │
//!                              │  │ discovery registry ◀── health checker ──▶ pools     │ │
//!                              │  │ watcher ──▶ pool sync       config, observability   │ │
//!                              │  └─────────────────────────────────────────────────────┘ │
//!                              └──────────────────────────────────────────────────────────┘
//! ```

use clap::Parser;
use std::path::PathBuf;
use tokio::net::TcpListener;

use balancing_proxy::config::{load_config, validate_config, ConfigError, ProxyConfig};
use balancing_proxy::lifecycle::{signals, Components, Shutdown};
use balancing_proxy::load_balancer::Algorithm;
use balancing_proxy::observability::{logging, metrics};
use balancing_proxy::HttpServer;

#[derive(Parser)]
#[command(name = "balancing-proxy")]
#[command(about = "HTTP and TCP software load balancer", long_about = None)]
struct Cli {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the default selection algorithm.
    #[arg(short, long)]
    algorithm: Option<Algorithm>,

    /// Override the HTTP bind address.
    #[arg(short, long)]
    bind: Option<String>,
}

fn load(cli: &Cli) -> Result<ProxyConfig, ConfigError> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };
    if let Some(algorithm) = cli.algorithm {
        config.balancer.algorithm = algorithm;
    }
    if let Some(bind) = &cli.bind {
        config.listener.bind_address = bind.clone();
    }
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load(&cli)?;
    logging::init(&config.observability);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        bind_address = %config.listener.bind_address,
        algorithm = config.balancer.algorithm.as_str(),
        backends = config.backends.len(),
        routes = config.routes.len(),
        "balancing-proxy starting"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr)?,
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let components = Components::build(config)?;
    let shutdown = Shutdown::new();
    signals::forward_to(&shutdown);
    let background = components.spawn_background(&shutdown);

    let tcp = match components.tcp_proxy() {
        Some(proxy) => {
            let listener = proxy.bind().await?;
            Some(tokio::spawn(proxy.run(listener, shutdown.subscribe())))
        }
        None => None,
    };

    let listener = TcpListener::bind(&components.config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let server = HttpServer::new(components.http_proxy(), &components.config.listener);
    server.run(listener, shutdown.signalled()).await?;

    // The server may also stop on its own; make sure everything else follows.
    shutdown.trigger();
    if let Some(tcp) = tcp {
        let _ = tcp.await;
    }
    for task in background {
        let _ = task.await;
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
