//! Header manipulation.
//!
//! # Responsibilities
//! - Strip hop-by-hop headers in both directions
//! - Set X-Forwarded-For, X-Forwarded-Host, X-Forwarded-Proto and X-Real-IP
//! - Apply per-route header additions and removals
//! - Add X-Backend-Server and optional CORS headers to responses
//!
//! # Design Decisions
//! - Forwarding headers are overwritten, never appended
//! - Headers listed in `Connection` are treated as hop-by-hop too

use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};

use crate::config::RouteConfig;

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
pub const X_REAL_IP: &str = "x-real-ip";
pub const X_BACKEND_SERVER: &str = "x-backend-server";

/// Headers meaningful only for a single transport hop.
pub const HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::UPGRADE,
];

/// Remove hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in HOP_BY_HOP.iter().chain(listed.iter()) {
        headers.remove(name);
    }
    headers.remove("trailers");
}

/// Rewrite client request headers for the upstream hop.
///
/// `host` is the original Host header; `Host` itself is dropped so the
/// upstream request carries the backend authority.
pub fn prepare_upstream(headers: &mut HeaderMap, client_ip: &str, proto: &str, route: &RouteConfig) {
    let host = headers.remove(header::HOST);
    strip_hop_by_hop(headers);

    if let Ok(ip) = HeaderValue::from_str(client_ip) {
        headers.insert(X_FORWARDED_FOR, ip.clone());
        headers.insert(X_REAL_IP, ip);
    }
    if let Some(host) = host {
        headers.insert(X_FORWARDED_HOST, host);
    }
    if let Ok(proto) = HeaderValue::from_str(proto) {
        headers.insert(X_FORWARDED_PROTO, proto);
    }

    for (name, value) in &route.add_headers {
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => tracing::warn!(route = %route.name, header = %name, "Skipping invalid route header"),
        }
    }
    for name in &route.remove_headers {
        headers.remove(name.as_str());
    }
}

/// Rewrite backend response headers for the client.
pub fn prepare_downstream(headers: &mut HeaderMap, backend_address: &str, enable_cors: bool) {
    strip_hop_by_hop(headers);
    headers.remove(header::TRANSFER_ENCODING);

    if let Ok(value) = HeaderValue::from_str(backend_address) {
        headers.insert(X_BACKEND_SERVER, value);
    }
    if enable_cors {
        add_cors(headers);
    }
}

pub fn add_cors(headers: &mut HeaderMap) {
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, PUT, DELETE, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization"),
    );
}
