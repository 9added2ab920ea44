//! Operations infrastructure for meridian nodes.
//!
//! This crate provides the operational components shared by the node and the
//! multiplexer:
//!
//! - **Config**: YAML-based configuration with fail-fast validation
//! - **Shutdown**: OS-signal handling and a cancellable worker group with
//!   first-error semantics
//! - **Observability**: logging initialization and Prometheus metrics

pub mod config;
pub mod errors;
pub mod observability;
pub mod shutdown;

pub use config::{load_config, write_default_config, NodeConfig};
pub use errors::ConfigError;
pub use observability::{init_tracing, MetricsRegistry, MuxMetrics};
pub use shutdown::{wait_for_signal, ShutdownSignal, WorkerError, WorkerGroup, WorkerSpawner};
