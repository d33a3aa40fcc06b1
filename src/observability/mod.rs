// Backend health probing
pub mod health;

// Subscriber setup
pub mod logging;

// Metric names and the Prometheus exporter
pub mod metrics;

pub use health::{HealthChecker, HealthTarget};
pub use logging::init_logging;
pub use metrics::install_exporter;
