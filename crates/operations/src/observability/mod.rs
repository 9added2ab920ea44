//! Observability: logging initialization and Prometheus metrics.

mod logging;
mod metrics;

pub use logging::init_tracing;
pub use metrics::{MetricsRegistry, MuxMetrics, ServerInfoLabels};
