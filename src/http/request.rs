//! Request handling and transformation.
//!
//! # Responsibilities
//! - Identify the client (forwarding headers, then the socket address)
//! - Build the upstream request: backend authority, rewritten path, sanitized headers
//!
//! # Design Decisions
//! - The request body is streamed through, never buffered
//! - The request ID set by the server layer is forwarded unchanged

use axum::body::Body;
use axum::http::uri::{Authority, PathAndQuery, Scheme};
use axum::http::{HeaderMap, Request, Uri};
use std::net::SocketAddr;
use std::str::FromStr;

use crate::http::response::ProxyError;
use crate::load_balancer::backend::Backend;
use crate::routing::Route;
use crate::security::headers::{self, X_FORWARDED_FOR, X_REAL_IP};

pub const X_REQUEST_ID: &str = "x-request-id";

/// Client IP: first `X-Forwarded-For` entry, then `X-Real-IP`, then the peer address.
pub fn client_ip(headers: &HeaderMap, remote: SocketAddr) -> String {
    let forwarded = headers
        .get(X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    headers
        .get(X_REAL_IP)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| remote.ip().to_string())
}

pub fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string()
}

/// Absolute upstream URI for `path` (rewritten by the route) plus the original query.
pub fn upstream_uri(backend: &Backend, route: &Route, original: &Uri) -> Result<Uri, ProxyError> {
    let path = route.rewrite(original.path());
    let path_and_query = match original.query() {
        Some(query) => format!("{}?{}", path, query),
        None => path,
    };

    let invalid = |reason: String| ProxyError::InvalidRequest { reason };
    let authority = Authority::from_str(&backend.address()).map_err(|e| invalid(e.to_string()))?;
    let path_and_query = PathAndQuery::from_str(&path_and_query).map_err(|e| invalid(e.to_string()))?;

    Uri::builder()
        .scheme(Scheme::HTTP)
        .authority(authority)
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| invalid(e.to_string()))
}

/// Turn the client request into the request sent to `backend`.
pub fn build_upstream_request(
    request: Request<Body>,
    backend: &Backend,
    route: &Route,
    client_ip: &str,
) -> Result<Request<Body>, ProxyError> {
    let (mut parts, body) = request.into_parts();
    parts.uri = upstream_uri(backend, route, &parts.uri)?;
    headers::prepare_upstream(&mut parts.headers, client_ip, "http", &route.config);
    Ok(Request::from_parts(parts, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouteConfig;
    use crate::load_balancer::pool::BackendPool;
    use crate::load_balancer::round_robin::RoundRobin;
    use crate::load_balancer::Balancer;
    use axum::http::HeaderValue;
    use std::sync::Arc;

    fn remote() -> SocketAddr {
        "192.168.1.9:40000".parse().unwrap()
    }

    fn route(rewrite: Option<&str>) -> Route {
        let mut config = RouteConfig::new("api", "/api", "web");
        config.rewrite_path = rewrite.map(str::to_string);
        let balancer = Balancer::new(Arc::new(BackendPool::new()), Box::new(RoundRobin::new()));
        Route::new(config, Arc::new(balancer))
    }

    #[test]
    fn client_ip_precedence() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, remote()), "192.168.1.9");

        headers.insert(X_REAL_IP, HeaderValue::from_static("10.0.0.2"));
        assert_eq!(client_ip(&headers, remote()), "10.0.0.2");

        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("10.0.0.1, 172.16.0.1"));
        assert_eq!(client_ip(&headers, remote()), "10.0.0.1");
    }

    #[test]
    fn upstream_uri_targets_backend_with_rewrite_and_query() {
        let backend = Backend::new("b1", "127.0.0.1", 8001, 1).unwrap();
        let original: Uri = "/api/users?page=2".parse().unwrap();

        let uri = upstream_uri(&backend, &route(None), &original).unwrap();
        assert_eq!(uri.to_string(), "http://127.0.0.1:8001/api/users?page=2");

        let uri = upstream_uri(&backend, &route(Some("/v1")), &original).unwrap();
        assert_eq!(uri.to_string(), "http://127.0.0.1:8001/v1/users?page=2");
    }

    #[test]
    fn upstream_request_carries_forwarding_headers() {
        let backend = Backend::new("b1", "127.0.0.1", 8001, 1).unwrap();
        let request = Request::builder()
            .uri("/api/x")
            .header("host", "lb.local")
            .header(X_REQUEST_ID, "req-1")
            .body(Body::empty())
            .unwrap();

        let upstream = build_upstream_request(request, &backend, &route(None), "10.1.1.1").unwrap();
        assert_eq!(upstream.headers()[X_FORWARDED_FOR], "10.1.1.1");
        assert_eq!(upstream.headers()[X_REQUEST_ID], "req-1");
        assert_eq!(upstream.uri().authority().unwrap().as_str(), "127.0.0.1:8001");
    }
}
