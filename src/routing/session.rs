//! Session affinity.
//!
//! # Responsibilities
//! - Derive a session id from a request (cookie, header, or client fingerprint)
//! - Remember which backend served a session
//! - Evict bindings idle for longer than the session timeout

use axum::http::{header, HeaderMap};
use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{self, Instant};

use crate::config::SessionConfig;
use crate::load_balancer::backend::Backend;
use crate::load_balancer::pool::BackendPool;

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub backend_id: String,
    pub backend_address: String,
    pub created_at: Instant,
    pub last_accessed: Instant,
    pub request_count: u64,
}

/// Maps session ids to the backend that served them.
#[derive(Debug)]
pub struct SessionManager {
    timeout: Duration,
    sweep_interval: Duration,
    cookie_name: String,
    header_name: String,
    sessions: DashMap<String, SessionRecord>,
}

impl SessionManager {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            sweep_interval: Duration::from_secs(config.sweep_interval_secs.max(1)),
            cookie_name: config.cookie_name.clone(),
            header_name: config.header_name.clone(),
            sessions: DashMap::new(),
        }
    }

    /// Session id from the session cookie, then the session header, else a
    /// SHA-256 hex digest of `client_ip:user_agent`.
    pub fn session_id(&self, headers: &HeaderMap, client_ip: &str) -> String {
        if let Some(id) = cookie_value(headers, &self.cookie_name) {
            return id;
        }

        if let Some(id) = headers
            .get(self.header_name.as_str())
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            return id.to_string();
        }

        let user_agent = headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let digest = Sha256::digest(format!("{}:{}", client_ip, user_agent).as_bytes());
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Backend bound to `session_id`, if the binding is unexpired and the
    /// backend is still a healthy member of `pool`. Refreshes the binding.
    pub fn get_backend_for_session(&self, session_id: &str, pool: &BackendPool) -> Option<Arc<Backend>> {
        let now = Instant::now();
        let mut record = self.sessions.get_mut(session_id)?;
        if now.duration_since(record.last_accessed) > self.timeout {
            return None;
        }

        let backend = pool.get(&record.backend_id).filter(|b| b.is_healthy())?;
        record.last_accessed = now;
        Some(backend)
    }

    /// Bind (or re-bind) a session to `backend`.
    pub fn bind_session(&self, session_id: &str, backend: &Backend) {
        let now = Instant::now();
        self.sessions
            .entry(session_id.to_string())
            .and_modify(|record| {
                if record.backend_id != backend.id {
                    record.backend_id = backend.id.clone();
                    record.backend_address = backend.address();
                    record.created_at = now;
                }
                record.last_accessed = now;
                record.request_count += 1;
            })
            .or_insert_with(|| SessionRecord {
                backend_id: backend.id.clone(),
                backend_address: backend.address(),
                created_at: now,
                last_accessed: now,
                request_count: 1,
            });
    }

    pub fn get_session(&self, session_id: &str) -> Option<SessionRecord> {
        self.sessions.get(session_id).map(|r| r.value().clone())
    }

    pub fn remove_session(&self, session_id: &str) -> bool {
        self.sessions.remove(session_id).is_some()
    }

    /// Drop every binding to `backend_id`. Returns how many were removed.
    pub fn clear_sessions_for_backend(&self, backend_id: &str) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, record| record.backend_id != backend_id);
        before - self.sessions.len()
    }

    /// Evict bindings idle for longer than the timeout.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.sessions.len();
        self.sessions
            .retain(|_, record| now.duration_since(record.last_accessed) <= self.timeout);
        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            tracing::debug!(removed, "Expired sessions swept");
        }
        removed
    }

    /// Sweep on `sweep_interval` until shutdown.
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = time::interval(self.sweep_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_expired();
                }
                _ = shutdown.recv() => {
                    tracing::debug!("Session sweeper received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn stats(&self) -> SessionStats {
        let mut backend_distribution = BTreeMap::new();
        let mut total_requests = 0;
        for record in self.sessions.iter() {
            *backend_distribution.entry(record.backend_id.clone()).or_insert(0) += 1;
            total_requests += record.request_count;
        }
        SessionStats {
            active_sessions: self.sessions.len(),
            backend_distribution,
            total_requests,
            timeout_secs: self.timeout.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub active_sessions: usize,
    pub backend_distribution: BTreeMap<String, usize>,
    pub total_requests: u64,
    pub timeout_secs: u64,
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, value)| *key == name && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn manager(timeout_secs: u64) -> SessionManager {
        SessionManager::new(&SessionConfig {
            timeout_secs,
            ..SessionConfig::default()
        })
    }

    fn pool() -> BackendPool {
        BackendPool::with_backends([
            Backend::new("b1", "127.0.0.1", 8001, 1).unwrap(),
            Backend::new("b2", "127.0.0.1", 8002, 1).unwrap(),
        ])
    }

    #[test]
    fn session_id_sources() {
        let sessions = manager(60);
        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, HeaderValue::from_static("curl/8"));
        let fingerprint = sessions.session_id(&headers, "10.0.0.1");
        assert_eq!(fingerprint.len(), 64);
        assert_eq!(fingerprint, sessions.session_id(&headers, "10.0.0.1"));
        assert_ne!(fingerprint, sessions.session_id(&headers, "10.0.0.2"));

        headers.insert("x-session-id", HeaderValue::from_static("from-header"));
        assert_eq!(sessions.session_id(&headers, "10.0.0.1"), "from-header");

        headers.insert(header::COOKIE, HeaderValue::from_static("theme=dark; LB_SESSION_ID=from-cookie"));
        assert_eq!(sessions.session_id(&headers, "10.0.0.1"), "from-cookie");
    }

    #[tokio::test(start_paused = true)]
    async fn binding_sticks_until_idle_timeout() {
        let sessions = manager(60);
        let pool = pool();
        let b2 = pool.get("b2").unwrap();
        sessions.bind_session("s1", &b2);

        for _ in 0..3 {
            time::advance(Duration::from_secs(30)).await;
            assert_eq!(sessions.get_backend_for_session("s1", &pool).unwrap().id, "b2");
        }

        time::advance(Duration::from_secs(61)).await;
        assert!(sessions.get_backend_for_session("s1", &pool).is_none());
        assert_eq!(sessions.sweep_expired(), 1);
        assert!(sessions.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_backend_breaks_affinity() {
        let sessions = manager(60);
        let pool = pool();
        sessions.bind_session("s1", &pool.get("b1").unwrap());
        pool.set_health("b1", false);
        assert!(sessions.get_backend_for_session("s1", &pool).is_none());

        pool.set_health("b1", true);
        assert!(sessions.get_backend_for_session("s1", &pool).is_some());
        pool.remove("b1");
        assert!(sessions.get_backend_for_session("s1", &pool).is_none());
    }

    #[test]
    fn stats_and_clearing() {
        let sessions = manager(60);
        let pool = pool();
        let b1 = pool.get("b1").unwrap();
        sessions.bind_session("s1", &b1);
        sessions.bind_session("s1", &b1);
        sessions.bind_session("s2", &b1);
        sessions.bind_session("s3", &pool.get("b2").unwrap());

        let stats = sessions.stats();
        assert_eq!(stats.active_sessions, 3);
        assert_eq!(stats.backend_distribution["b1"], 2);
        assert_eq!(stats.total_requests, 4);
        assert_eq!(sessions.get_session("s1").unwrap().request_count, 2);

        assert_eq!(sessions.clear_sessions_for_backend("b1"), 2);
        assert!(sessions.remove_session("s3"));
        assert!(!sessions.remove_session("s3"));
    }
}
