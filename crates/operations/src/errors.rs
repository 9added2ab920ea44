//! Error types for the operations crate.

use thiserror::Error;

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File I/O error when loading config.
    #[error("failed to read config file '{path}': {source}")]
    FileRead {
        path: String,
        source: std::io::Error,
    },

    /// File I/O error when writing config.
    #[error("failed to write config file '{path}': {source}")]
    FileWrite {
        path: String,
        source: std::io::Error,
    },

    /// YAML parsing error.
    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },

    /// Validation failed with one or more errors.
    #[error("config validation failed:\n{}", .0.join("\n"))]
    ValidationFailed(Vec<String>),
}
