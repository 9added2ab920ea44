//! Configuration types for the node.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration for a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// Root directory. The application database lives under `<home>/data`.
    pub home: String,

    /// Chain identifier, propagated into legacy wire envelopes.
    pub chain_id: String,

    /// App version assumed at boot when no persisted chain state exists.
    #[serde(default = "NodeConfig::default_initial_app_version")]
    pub initial_app_version: u64,

    /// Loopback URL the consensus engine dials for the application protocol.
    /// Must string-equal `address`.
    #[serde(default = "NodeConfig::default_abci_addr")]
    pub proxy_app: String,

    /// Loopback URL the application binds. A `tcp://` prefix is stripped
    /// before dialing.
    #[serde(default = "NodeConfig::default_abci_addr")]
    pub address: String,

    /// Backend name handed to the application when opening its database.
    #[serde(default = "NodeConfig::default_db_backend")]
    pub db_backend: String,

    /// Disable the consensus node and force the gRPC server on.
    #[serde(default)]
    pub grpc_only: bool,

    /// Optional trace sink path. Empty disables tracing; otherwise the file
    /// is opened in append mode.
    #[serde(default)]
    pub trace_store: String,

    /// In-process gRPC server configuration.
    #[serde(default)]
    pub grpc: GrpcConfig,

    /// API server configuration.
    #[serde(default)]
    pub api: ApiConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Embedded application table, ordered by app version at load time.
    #[serde(default)]
    pub versions: Vec<EmbeddedVersionConfig>,
}

impl NodeConfig {
    const fn default_initial_app_version() -> u64 {
        1
    }

    fn default_abci_addr() -> String {
        "tcp://127.0.0.1:26658".to_string()
    }

    fn default_db_backend() -> String {
        "memdb".to_string()
    }

    /// Directory holding the application database.
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.home).join("data")
    }

    /// Trace sink path, `None` when disabled.
    pub fn trace_store(&self) -> Option<&str> {
        if self.trace_store.is_empty() {
            None
        } else {
            Some(&self.trace_store)
        }
    }
}

/// In-process gRPC server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GrpcConfig {
    /// Whether the in-process gRPC server is enabled.
    #[serde(default)]
    pub enable: bool,

    /// gRPC address to bind to.
    #[serde(default = "GrpcConfig::default_address")]
    pub address: String,

    /// Maximum outbound message size in bytes. Zero means default.
    #[serde(default)]
    pub max_send_msg_size: usize,

    /// Maximum inbound message size in bytes. Zero means default.
    #[serde(default)]
    pub max_recv_msg_size: usize,
}

impl GrpcConfig {
    /// Default maximum outbound message size: effectively unbounded, block
    /// payloads can be large.
    pub const DEFAULT_MAX_SEND_MSG_SIZE: usize = i32::MAX as usize;

    /// Default maximum inbound message size: 10MB.
    pub const DEFAULT_MAX_RECV_MSG_SIZE: usize = 10 * 1024 * 1024;

    fn default_address() -> String {
        "127.0.0.1:9090".to_string()
    }

    /// Send limit with the zero-means-default rule applied.
    pub fn effective_max_send_msg_size(&self) -> usize {
        if self.max_send_msg_size == 0 {
            Self::DEFAULT_MAX_SEND_MSG_SIZE
        } else {
            self.max_send_msg_size
        }
    }

    /// Receive limit with the zero-means-default rule applied.
    pub fn effective_max_recv_msg_size(&self) -> usize {
        if self.max_recv_msg_size == 0 {
            Self::DEFAULT_MAX_RECV_MSG_SIZE
        } else {
            self.max_recv_msg_size
        }
    }
}

impl Default for GrpcConfig {
    fn default() -> Self {
        Self {
            enable: false,
            address: Self::default_address(),
            max_send_msg_size: 0,
            max_recv_msg_size: 0,
        }
    }
}

/// API server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiConfig {
    /// Whether the API server is enabled. Requires `grpc.enable`.
    #[serde(default)]
    pub enable: bool,

    /// HTTP address to bind to.
    #[serde(default = "ApiConfig::default_address")]
    pub address: String,
}

impl ApiConfig {
    fn default_address() -> String {
        "127.0.0.1:1317".to_string()
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enable: false,
            address: Self::default_address(),
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetryConfig {
    /// Whether metrics are exposed through the API server.
    #[serde(default)]
    pub enabled: bool,

    /// Service name attached to emitted metrics.
    #[serde(default = "TelemetryConfig::default_service_name")]
    pub service_name: String,
}

impl TelemetryConfig {
    fn default_service_name() -> String {
        "meridian".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            service_name: Self::default_service_name(),
        }
    }
}

/// Observability configuration for logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObservabilityConfig {
    /// Log level: trace, debug, info, warn, error. Default: info.
    #[serde(default = "ObservabilityConfig::default_log_level")]
    pub log_level: String,

    /// Log format: json or pretty. Default: pretty.
    #[serde(default = "ObservabilityConfig::default_log_format")]
    pub log_format: String,
}

impl ObservabilityConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }

    fn default_log_format() -> String {
        "pretty".to_string()
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            log_format: Self::default_log_format(),
        }
    }
}

/// One embedded application in the version table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmbeddedVersionConfig {
    /// Chain-level app version this binary serves.
    pub app_version: u64,

    /// Wire protocol vintage the binary speaks: "v1" or "v2".
    pub abci_version: String,

    /// Path to the embedded executable.
    pub binary: String,

    /// One-shot sub-commands run before `start`, in order. Advisory.
    #[serde(default)]
    pub pre_handlers: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_grpc_config() {
        let config = GrpcConfig::default();
        assert!(!config.enable);
        assert_eq!(config.address, "127.0.0.1:9090");
        assert_eq!(
            config.effective_max_send_msg_size(),
            GrpcConfig::DEFAULT_MAX_SEND_MSG_SIZE
        );
        assert_eq!(
            config.effective_max_recv_msg_size(),
            GrpcConfig::DEFAULT_MAX_RECV_MSG_SIZE
        );
    }

    #[test]
    fn explicit_msg_sizes_win_over_defaults() {
        let config = GrpcConfig {
            max_send_msg_size: 1024,
            max_recv_msg_size: 2048,
            ..Default::default()
        };
        assert_eq!(config.effective_max_send_msg_size(), 1024);
        assert_eq!(config.effective_max_recv_msg_size(), 2048);
    }

    #[test]
    fn trace_store_empty_means_disabled() {
        let config: NodeConfig = serde_yaml::from_str(
            r#"
home: "/tmp/meridian"
chain_id: meridian-1
"#,
        )
        .unwrap();
        assert!(config.trace_store().is_none());
        assert_eq!(config.data_dir(), PathBuf::from("/tmp/meridian/data"));
    }
}
