//! # Metrics
//!
//! Metric names recorded by the proxy, and the Prometheus exporter that serves them.
//!
//! Recording goes through the `metrics` facade macros at the call sites. Until
//! [`install_exporter`] runs there is no recorder and every macro call is a no-op, so the
//! library can be used (and tested) without an exporter.

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use tracing::info;

use crate::core::config::MetricsConfig;
use crate::core::error::{GatewayError, GatewayResult};

/// Requests answered, labelled by `status` and `upstream`
pub const REQUESTS_TOTAL: &str = "gatehouse_requests_total";
/// End-to-end request latency, labelled by `upstream`
pub const REQUEST_DURATION_SECONDS: &str = "gatehouse_request_duration_seconds";
/// 1 when a backend passes its health probe, 0 otherwise
pub const BACKEND_HEALTHY: &str = "gatehouse_backend_healthy";
/// Backend selections, labelled by `upstream` and `algorithm`
pub const BACKEND_SELECTIONS_TOTAL: &str = "gatehouse_backend_selections_total";

const LATENCY_BUCKETS: [f64; 12] = [
    0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 10.0,
];

/// Install the global Prometheus recorder and its HTTP listener on `config.addr`.
///
/// Does nothing when metrics are disabled. Must run inside a tokio runtime.
pub fn install_exporter(config: &MetricsConfig) -> GatewayResult<()> {
    if !config.enabled {
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(config.addr)
        .set_buckets_for_metric(
            Matcher::Full(REQUEST_DURATION_SECONDS.to_string()),
            &LATENCY_BUCKETS,
        )
        .map_err(|e| GatewayError::internal(format!("invalid histogram buckets: {}", e)))?
        .install()
        .map_err(|e| GatewayError::internal(format!("failed to install metrics exporter: {}", e)))?;

    describe_metrics();
    info!(addr = %config.addr, "📊 Prometheus exporter listening");
    Ok(())
}

fn describe_metrics() {
    describe_counter!(REQUESTS_TOTAL, Unit::Count, "Requests answered by the proxy");
    describe_histogram!(
        REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Time from request arrival to response headers"
    );
    describe_gauge!(BACKEND_HEALTHY, "Backend health as seen by the last probe");
    describe_counter!(
        BACKEND_SELECTIONS_TOTAL,
        Unit::Count,
        "Backends chosen by the load balancer"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_exporter_is_noop() {
        let config = MetricsConfig {
            enabled: false,
            addr: "127.0.0.1:0".parse().unwrap(),
            path: "/metrics".to_string(),
        };
        assert!(install_exporter(&config).is_ok());
    }

    #[test]
    fn test_buckets_are_sorted() {
        assert!(LATENCY_BUCKETS.windows(2).all(|pair| pair[0] < pair[1]));
    }
}
