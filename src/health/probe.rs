//! Liveness probes.
//!
//! Probes never return errors: anything other than a 2xx answer (HTTP) or an
//! established connection (TCP) is "unhealthy". The caller bounds each probe
//! with its own timeout.

use axum::body::Body;
use axum::http::Request;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::net::TcpStream;

use crate::config::ProbeKind;

#[derive(Clone)]
pub struct Prober {
    kind: ProbeKind,
    path: String,
    client: Client<HttpConnector, Body>,
}

impl std::fmt::Debug for Prober {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prober")
            .field("kind", &self.kind)
            .field("path", &self.path)
            .finish()
    }
}

impl Prober {
    pub fn new(kind: ProbeKind, path: impl Into<String>) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self {
            kind,
            path: path.into(),
            client,
        }
    }

    pub fn kind(&self) -> ProbeKind {
        self.kind
    }

    pub async fn probe(&self, host: &str, port: u16) -> bool {
        match self.kind {
            ProbeKind::Http => self.probe_http(host, port).await,
            ProbeKind::Tcp => probe_tcp(host, port).await,
        }
    }

    async fn probe_http(&self, host: &str, port: u16) -> bool {
        let uri = format!("http://{}:{}{}", host, port, self.path);
        let request = match Request::builder()
            .method("GET")
            .uri(&uri)
            .header("user-agent", "balancing-proxy-health-check")
            .body(Body::empty())
        {
            Ok(req) => req,
            Err(e) => {
                tracing::error!(uri = %uri, error = %e, "Failed to build health check request");
                return false;
            }
        };

        match self.client.request(request).await {
            Ok(response) => {
                let success = response.status().is_success();
                if !success {
                    tracing::debug!(uri = %uri, status = %response.status(), "Health check failed: non-success status");
                }
                success
            }
            Err(e) => {
                tracing::debug!(uri = %uri, error = %e, "Health check failed: connection error");
                false
            }
        }
    }
}

async fn probe_tcp(host: &str, port: u16) -> bool {
    match TcpStream::connect((host, port)).await {
        Ok(_) => true,
        Err(e) => {
            tracing::debug!(host = %host, port, error = %e, "Health check failed: connect error");
            false
        }
    }
}
