//! Route lookup.
//!
//! # Responsibilities
//! - Store compiled routes
//! - Look up the route for a request path
//! - Rewrite the forwarded path
//!
//! # Design Decisions
//! - Immutable after construction (thread-safe without locks)
//! - O(1) exact lookup via HashMap, then longest prefix, then the default route
//! - Prefixes match whole path segments: `/api` covers `/api` and `/api/x`,
//!   never `/apiary`
//! - Each route owns a balancer over its group's shared pool so that a route
//!   can override the algorithm without affecting other routes

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{BalancerConfig, RouteConfig};
use crate::load_balancer::pool::BackendManager;
use crate::load_balancer::{Balancer, BalancerError};

/// Group used by the implicit catch-all route when no routes are configured.
pub const DEFAULT_GROUP: &str = "default";

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("route '{route}' references unknown backend group '{group}'")]
    UnknownGroup { route: String, group: String },

    #[error("duplicate route path '{path}'")]
    DuplicatePath { path: String },

    #[error("route '{route}': {source}")]
    Balancer {
        route: String,
        #[source]
        source: BalancerError,
    },
}

/// A compiled route.
#[derive(Debug)]
pub struct Route {
    pub config: RouteConfig,
    balancer: Arc<Balancer>,
}

impl Route {
    pub fn new(config: RouteConfig, balancer: Arc<Balancer>) -> Self {
        Self { config, balancer }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn balancer(&self) -> &Arc<Balancer> {
        &self.balancer
    }

    /// Path to forward upstream. With `rewrite_path` set, the matched part of
    /// `path` is replaced and the remainder is kept.
    pub fn rewrite(&self, path: &str) -> String {
        let Some(replacement) = self.config.rewrite_path.as_deref() else {
            return path.to_string();
        };

        let rest = path.strip_prefix(self.config.path.as_str()).unwrap_or(path);
        let rest = rest.trim_start_matches('/');
        if rest.is_empty() {
            return ensure_leading_slash(replacement);
        }
        let base = replacement.trim_end_matches('/');
        ensure_leading_slash(&format!("{}/{}", base, rest))
    }
}

/// True if `prefix` matches `path` on a segment boundary.
fn covers(prefix: &str, path: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'),
        None => false,
    }
}

fn ensure_leading_slash(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

/// Routing table: exact path, then longest prefix, then default.
#[derive(Debug, Default)]
pub struct RouteTable {
    exact: HashMap<String, Arc<Route>>,
    /// Sorted by path length, longest first.
    prefixes: Vec<Arc<Route>>,
    default: Option<Arc<Route>>,
}

impl RouteTable {
    /// Compile route configs against the backend groups.
    ///
    /// With no routes configured, every request goes to the `default` group
    /// if one exists.
    pub fn from_config(
        routes: &[RouteConfig],
        backends: &BackendManager,
        balancer: &BalancerConfig,
    ) -> Result<Self, RouteError> {
        let mut table = RouteTable::default();

        if routes.is_empty() {
            if let Some(group) = backends.group(DEFAULT_GROUP) {
                let mut config = RouteConfig::new(DEFAULT_GROUP, "/", DEFAULT_GROUP);
                config.default = true;
                table.insert(Route::new(config, group))?;
            }
            return Ok(table);
        }

        for config in routes {
            let group = backends.group(&config.backend_group).ok_or_else(|| RouteError::UnknownGroup {
                route: config.name.clone(),
                group: config.backend_group.clone(),
            })?;

            let route_balancer = match config.algorithm {
                Some(algorithm) if algorithm.as_str() != group.algorithm() => Arc::new(
                    Balancer::from_config(Arc::clone(group.pool()), algorithm, balancer).map_err(|source| {
                        RouteError::Balancer {
                            route: config.name.clone(),
                            source,
                        }
                    })?,
                ),
                _ => group,
            };

            tracing::debug!(
                route = %config.name,
                path = %config.path,
                group = %config.backend_group,
                algorithm = route_balancer.algorithm(),
                "Route compiled"
            );
            table.insert(Route::new(config.clone(), route_balancer))?;
        }

        Ok(table)
    }

    /// Add a route. Default routes do not take part in path matching.
    pub fn insert(&mut self, route: Route) -> Result<(), RouteError> {
        let route = Arc::new(route);
        if route.config.default {
            self.default = Some(route);
            return Ok(());
        }

        let path = route.config.path.clone();
        if self.exact.contains_key(&path) {
            return Err(RouteError::DuplicatePath { path });
        }
        if route.config.prefix {
            self.prefixes.push(Arc::clone(&route));
            self.prefixes
                .sort_by(|a, b| b.config.path.len().cmp(&a.config.path.len()));
        }
        self.exact.insert(path, route);
        Ok(())
    }

    /// Route for `path`, or `None` if nothing matches and there is no default.
    pub fn match_path(&self, path: &str) -> Option<Arc<Route>> {
        if let Some(route) = self.exact.get(path) {
            return Some(Arc::clone(route));
        }

        self.prefixes
            .iter()
            .find(|route| covers(&route.config.path, path))
            .or(self.default.as_ref())
            .cloned()
    }

    pub fn routes(&self) -> Vec<Arc<Route>> {
        let mut routes: Vec<Arc<Route>> = self.exact.values().cloned().collect();
        routes.sort_by(|a, b| a.config.path.cmp(&b.config.path));
        routes.extend(self.default.iter().cloned());
        routes
    }

    pub fn len(&self) -> usize {
        self.exact.len() + usize::from(self.default.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
