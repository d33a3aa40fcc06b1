//! # Upstream Manager
//!
//! Owns every named backend [`Pool`]. A pool is built once from its resolved
//! [`UpstreamConfig`] and never mutated afterwards:
//!
//! - its backends (weight defaults to 1)
//! - one [`LoadBalancer`] chosen by the `algorithm` tag
//! - one pooled HTTP client carrying the upstream's timeouts, idle limits and TLS settings
//! - a [`HealthChecker`], started only when `health_check` is configured, bound to the
//!   pool's `CancellationToken`
//!
//! Pools are registered in a `DashMap` held by the manager instance. There is no global
//! registry, so independent managers (for example one per test) never see each other's
//! pools or checkers.

use dashmap::DashMap;
use http::HeaderMap;
use metrics::counter;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::config::{Config, UpstreamConfig};
use crate::core::error::{GatewayError, GatewayResult};
use crate::load_balancing::{Backend, LoadBalancer, Selection};
use crate::observability::health::HealthChecker;
use crate::observability::metrics::BACKEND_SELECTIONS_TOTAL;

/// A named group of backends sharing one balancer and one health policy
#[derive(Debug)]
pub struct Pool {
    config: UpstreamConfig,
    backends: Arc<[Arc<Backend>]>,
    balancer: LoadBalancer,
    client: reqwest::Client,
    cancel: CancellationToken,
    health_checked: bool,
}

impl Pool {
    /// Build the pool and, if configured, start its health checker as a child of `parent`
    pub fn new(config: &UpstreamConfig, parent: &CancellationToken) -> GatewayResult<Self> {
        let backends: Arc<[Arc<Backend>]> = config
            .addrs
            .iter()
            .enumerate()
            .map(|(index, addr)| Arc::new(Backend::new(addr.clone(), config.weight_of(index))))
            .collect();

        let client = build_client(config)?;
        let cancel = parent.child_token();

        let health_checked = config.health_check.is_some();
        if health_checked {
            if tokio::runtime::Handle::try_current().is_err() {
                return Err(GatewayError::internal(format!(
                    "upstream '{}': health checking needs a running tokio runtime",
                    config.name
                )));
            }
            HealthChecker::new(config, Arc::clone(&backends))?.spawn(cancel.clone());
        }

        Ok(Self {
            config: config.clone(),
            backends,
            balancer: LoadBalancer::new(config.algorithm),
            client,
            cancel,
            health_checked,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    /// Connection-pooled client scoped to this upstream
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn is_health_checked(&self) -> bool {
        self.health_checked
    }

    /// Select a backend for one request
    pub fn next(&self, headers: &HeaderMap, remote: Option<SocketAddr>) -> GatewayResult<Selection> {
        let selection = self
            .balancer
            .next(&self.backends, headers, remote)
            .ok_or_else(|| GatewayError::NoBackends {
                upstream: self.config.name.clone(),
            })?;

        counter!(
            BACKEND_SELECTIONS_TOTAL,
            "upstream" => self.config.name.clone(),
            "algorithm" => self.balancer.algorithm().as_str()
        )
        .increment(1);

        debug!(
            upstream = %self.config.name,
            backend = %selection.addr(),
            algorithm = self.balancer.algorithm().as_str(),
            "Selected backend"
        );

        Ok(selection)
    }

    /// Stop the pool's background work
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn build_client(config: &UpstreamConfig) -> GatewayResult<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(config.connection_timeout)
        .read_timeout(config.read_timeout)
        .pool_idle_timeout(config.idle_timeout)
        .danger_accept_invalid_certs(!config.tls_verify)
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy();

    if config.max_idle_conns_per_host > 0 {
        builder = builder.pool_max_idle_per_host(config.max_idle_conns_per_host);
    }

    if let (Some(cert), Some(key)) = (&config.tls_cert, &config.tls_key) {
        let mut pem = std::fs::read(cert).map_err(|e| {
            GatewayError::tls(format!(
                "upstream '{}': failed to read tls_cert {}: {}",
                config.name,
                cert.display(),
                e
            ))
        })?;
        pem.extend(std::fs::read(key).map_err(|e| {
            GatewayError::tls(format!(
                "upstream '{}': failed to read tls_key {}: {}",
                config.name,
                key.display(),
                e
            ))
        })?);
        let identity = reqwest::Identity::from_pem(&pem).map_err(|e| {
            GatewayError::tls(format!("upstream '{}': invalid client identity: {}", config.name, e))
        })?;
        builder = builder.identity(identity);
    }

    builder.build().map_err(|e| {
        GatewayError::internal(format!(
            "upstream '{}': failed to build HTTP client: {}",
            config.name, e
        ))
    })
}

/// Registry of named pools
#[derive(Debug)]
pub struct UpstreamManager {
    pools: DashMap<String, Arc<Pool>>,
    cancel: CancellationToken,
}

impl Default for UpstreamManager {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamManager {
    pub fn new() -> Self {
        Self {
            pools: DashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Create a pool for every upstream in the configuration
    pub fn from_config(config: &Config) -> GatewayResult<Self> {
        let manager = Self::new();
        for upstream in &config.upstreams {
            manager.add_upstream(upstream)?;
        }
        Ok(manager)
    }

    /// Build and register a pool. Names are unique for the manager's lifetime.
    pub fn add_upstream(&self, config: &UpstreamConfig) -> GatewayResult<Arc<Pool>> {
        if self.pools.contains_key(&config.name) {
            return Err(GatewayError::config(format!(
                "upstream '{}' is already registered",
                config.name
            )));
        }

        let pool = Arc::new(Pool::new(config, &self.cancel)?);
        self.pools.insert(config.name.clone(), Arc::clone(&pool));

        info!(
            upstream = %config.name,
            backends = config.addrs.len(),
            algorithm = config.algorithm.as_str(),
            health_checked = pool.is_health_checked(),
            "Registered upstream"
        );
        Ok(pool)
    }

    pub fn get(&self, name: &str) -> GatewayResult<Arc<Pool>> {
        self.pools
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| GatewayError::UpstreamNotFound {
                upstream: name.to_string(),
            })
    }

    /// Unregister a pool and stop its health checker
    pub fn remove(&self, name: &str) -> Option<Arc<Pool>> {
        let (_, pool) = self.pools.remove(name)?;
        pool.shutdown();
        info!(upstream = %name, "Removed upstream");
        Some(pool)
    }

    pub fn names(&self) -> Vec<String> {
        self.pools.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Stop every pool's background work
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for UpstreamManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
