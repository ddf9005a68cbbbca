pub mod metrics_collector;
pub mod structured_logger;

pub use metrics_collector::{install_prometheus_exporter, MetricsCollector};
pub use structured_logger::{LoggingHook, StructuredLogger};
