//! Node configuration: types, loading, and validation.

mod loader;
mod types;
mod validation;

pub use loader::{ensure_config_exists, load_config, load_config_from_str, write_default_config};
pub use types::{
    ApiConfig, EmbeddedVersionConfig, GrpcConfig, NodeConfig, ObservabilityConfig, TelemetryConfig,
};
pub use validation::validate_config;
