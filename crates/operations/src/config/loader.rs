//! Configuration file loading.

use std::path::Path;

use crate::config::types::NodeConfig;
use crate::config::validation::validate_config;
use crate::errors::ConfigError;

/// Load and validate configuration from a YAML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, the YAML is invalid, or any
/// configuration value fails validation.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<NodeConfig, ConfigError> {
    let path = path.as_ref();
    let path_str = path.display().to_string();

    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path_str.clone(),
        source: e,
    })?;

    load_config_from_str(&content, &path_str)
}

/// Load and validate configuration from a YAML string.
///
/// Useful for testing or when config is provided via other means.
pub fn load_config_from_str(content: &str, source_name: &str) -> Result<NodeConfig, ConfigError> {
    let config: NodeConfig = serde_yaml::from_str(content).map_err(|e| ConfigError::Parse {
        path: source_name.to_string(),
        source: e,
    })?;

    validate_config(&config)?;

    Ok(config)
}

/// Write a commented default configuration file for the given home directory.
pub fn write_default_config<P: AsRef<Path>>(path: P, home: &str) -> Result<(), ConfigError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::FileWrite {
            path: path.display().to_string(),
            source: e,
        })?;
    }
    std::fs::write(path, default_config_yaml(home)).map_err(|e| ConfigError::FileWrite {
        path: path.display().to_string(),
        source: e,
    })
}

/// Write a default config file at `path` unless one already exists.
pub fn ensure_config_exists<P: AsRef<Path>>(path: P, home: &str) -> Result<(), ConfigError> {
    if path.as_ref().exists() {
        return Ok(());
    }
    write_default_config(path, home)
}

fn default_config_yaml(home: &str) -> String {
    format!(
        r#"# meridiand configuration

# Root directory. The application database lives under <home>/data.
home: "{home}"

chain_id: "meridian-1"

# App version assumed at boot when no persisted chain state exists.
initial_app_version: 1

# The consensus engine dials proxy_app; the application binds address.
# These must match.
proxy_app: "tcp://127.0.0.1:26658"
address: "tcp://127.0.0.1:26658"

db_backend: "memdb"

# Disable the consensus node and force the gRPC server on.
grpc_only: false

# Optional trace sink path, opened in append mode. Empty disables tracing.
trace_store: ""

grpc:
  enable: false
  address: "127.0.0.1:9090"
  # Zero means default.
  max_send_msg_size: 0
  max_recv_msg_size: 0

api:
  enable: false
  address: "127.0.0.1:1317"

telemetry:
  enabled: false
  service_name: "meridian"

observability:
  log_level: "info"
  log_format: "pretty"

# Embedded application table. Each entry names an executable supervised by
# the multiplexer for the given app version.
versions: []
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const VALID_CONFIG: &str = r#"
home: "/tmp/meridian"
chain_id: meridian-1

grpc:
  enable: true
  address: "127.0.0.1:9090"

versions:
  - app_version: 2
    abci_version: v1
    binary: "/usr/local/bin/meridiand-v2"
    pre_handlers: [migrate]
"#;

    #[test]
    fn load_valid_config() {
        let config = load_config_from_str(VALID_CONFIG, "config.yaml").unwrap();
        assert_eq!(config.chain_id, "meridian-1");
        assert!(config.grpc.enable);
        assert_eq!(config.versions.len(), 1);
        assert_eq!(config.versions[0].pre_handlers, vec!["migrate"]);
    }

    #[test]
    fn unknown_field_rejected() {
        let content = r#"
home: "/tmp/meridian"
chain_id: meridian-1
unknown_field: "bad"
"#;
        let result = load_config_from_str(content, "config.yaml");
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn defaults_applied() {
        let content = r#"
home: "/tmp/meridian"
chain_id: meridian-1
"#;
        let config = load_config_from_str(content, "config.yaml").unwrap();
        assert_eq!(config.initial_app_version, 1);
        assert_eq!(config.proxy_app, "tcp://127.0.0.1:26658");
        assert_eq!(config.address, "tcp://127.0.0.1:26658");
        assert!(!config.grpc_only);
        assert!(config.versions.is_empty());
        assert_eq!(config.observability.log_level, "info");
    }

    #[test]
    fn invalid_yaml_syntax() {
        let bad_yaml = "home:\n  chain_id: [invalid";
        let result = load_config_from_str(bad_yaml, "config.yaml");
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn validation_runs_after_parse() {
        let content = r#"
home: ""
chain_id: meridian-1
"#;
        let result = load_config_from_str(content, "config.yaml");
        assert!(matches!(result, Err(ConfigError::ValidationFailed(_))));
    }

    #[test]
    fn default_config_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        let home = dir.path().display().to_string();

        write_default_config(&path, &home).unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.home, home);
        assert_eq!(config.chain_id, "meridian-1");

        // A second ensure call must not clobber the existing file.
        ensure_config_exists(&path, "/somewhere/else").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.home, home);
    }
}
