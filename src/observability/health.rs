//! # Health Checking
//!
//! One [`HealthChecker`] runs per upstream pool that declares a `health_check` target.
//! It probes every backend of the pool concurrently, once immediately at start-up and
//! then on every interval tick, and flips each backend's health flag:
//!
//! - any 2xx response marks the backend healthy and resets its failure counter
//! - any other status, a transport error or a timeout marks it unhealthy and increments
//!   its failure counter
//!
//! The checker stops only when the `CancellationToken` it was started with is cancelled.
//! The owning pool cancels it when it is removed or dropped.
//!
//! ## Rust Concepts Used
//! - `tokio::time::interval` for scheduled checks
//! - `tokio::select!` to race the next tick against cancellation
//! - `tokio::task::JoinSet` for one probe task per backend per tick

use metrics::gauge;
use reqwest::Client as HttpClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::config::UpstreamConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::load_balancing::Backend;
use crate::observability::metrics::BACKEND_HEALTHY;

/// Where a backend's health endpoint lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthTarget {
    /// Path appended to `http://<addr>`
    Path(String),
    /// Full URL; `{addr}` is replaced with the backend address
    Url(String),
}

impl Default for HealthTarget {
    fn default() -> Self {
        Self::Path("/health".to_string())
    }
}

impl HealthTarget {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() {
            Self::default()
        } else if raw.starts_with("http://") || raw.starts_with("https://") {
            Self::Url(raw.to_string())
        } else if raw.starts_with('/') {
            Self::Path(raw.to_string())
        } else {
            Self::Path(format!("/{}", raw))
        }
    }

    pub fn url_for(&self, addr: &str) -> String {
        match self {
            Self::Path(path) => format!("http://{}{}", addr, path),
            Self::Url(url) => url.replace("{addr}", addr),
        }
    }
}

pub struct HealthChecker {
    upstream: String,
    backends: Arc<[Arc<Backend>]>,
    target: HealthTarget,
    interval: Duration,
    client: HttpClient,
}

impl HealthChecker {
    /// Build a checker for one pool. Probes time out after the pool's connection timeout.
    pub fn new(config: &UpstreamConfig, backends: Arc<[Arc<Backend>]>) -> GatewayResult<Self> {
        if config.health_check_interval.is_zero() {
            return Err(GatewayError::config(format!(
                "upstream '{}': health_check_interval: must be greater than zero",
                config.name
            )));
        }

        let client = HttpClient::builder()
            .timeout(config.connection_timeout)
            .connect_timeout(config.connection_timeout)
            .danger_accept_invalid_certs(!config.tls_verify)
            .build()
            .map_err(|e| {
                GatewayError::internal(format!(
                    "failed to build health check client for upstream '{}': {}",
                    config.name, e
                ))
            })?;

        Ok(Self {
            upstream: config.name.clone(),
            backends,
            target: HealthTarget::parse(config.health_check.as_deref().unwrap_or_default()),
            interval: config.health_check_interval,
            client,
        })
    }

    pub fn target(&self) -> &HealthTarget {
        &self.target
    }

    /// Run on the current runtime until `cancel` fires
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(
            upstream = %self.upstream,
            interval = ?self.interval,
            backends = self.backends.len(),
            "Starting health checker"
        );

        // The first tick completes immediately, which gives the start-up check
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.check_all() => {}
            }
        }

        debug!(upstream = %self.upstream, "Health checker stopped");
    }

    /// Probe every backend concurrently and record the results
    pub async fn check_all(&self) {
        let mut probes = JoinSet::new();
        for backend in self.backends.iter() {
            let client = self.client.clone();
            let backend = Arc::clone(backend);
            let url = self.target.url_for(backend.addr());
            probes.spawn(async move {
                let outcome = probe(&client, &url).await;
                (backend, url, outcome)
            });
        }

        while let Some(joined) = probes.join_next().await {
            let Ok((backend, url, outcome)) = joined else {
                continue;
            };
            match outcome {
                Ok(()) => {
                    if backend.mark_healthy() {
                        info!(
                            upstream = %self.upstream,
                            backend = %backend.addr(),
                            "Backend recovered"
                        );
                    }
                }
                Err(reason) => {
                    if backend.mark_unhealthy() {
                        warn!(
                            upstream = %self.upstream,
                            backend = %backend.addr(),
                            url = %url,
                            reason = %reason,
                            "Backend marked unhealthy"
                        );
                    } else {
                        debug!(
                            upstream = %self.upstream,
                            backend = %backend.addr(),
                            failures = backend.health().failures,
                            reason = %reason,
                            "Health probe failed"
                        );
                    }
                }
            }

            gauge!(
                BACKEND_HEALTHY,
                "upstream" => self.upstream.clone(),
                "backend" => backend.addr().to_string()
            )
            .set(if backend.is_healthy() { 1.0 } else { 0.0 });
        }
    }
}

async fn probe(client: &HttpClient, url: &str) -> Result<(), String> {
    match client.get(url).send().await {
        Ok(response) if response.status().is_success() => Ok(()),
        Ok(response) => Err(format!("unexpected status {}", response.status().as_u16())),
        Err(e) if e.is_timeout() => Err("probe timed out".to_string()),
        Err(e) => Err(format!("probe failed: {}", e)),
    }
}
