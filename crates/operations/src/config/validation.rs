//! Configuration validation.
//!
//! Validates configuration and collects all errors before returning,
//! enabling users to fix multiple issues in a single iteration.

use std::collections::HashSet;

use crate::config::types::{ApiConfig, GrpcConfig, NodeConfig, ObservabilityConfig};
use crate::errors::ConfigError;

/// Validate the entire node configuration.
///
/// Collects all validation errors and returns them together, allowing users
/// to fix multiple issues at once.
pub fn validate_config(config: &NodeConfig) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    if config.home.is_empty() {
        errors.push("home cannot be empty".to_string());
    }
    if config.chain_id.is_empty() {
        errors.push("chain_id cannot be empty".to_string());
    }
    if config.proxy_app.is_empty() {
        errors.push("proxy_app cannot be empty".to_string());
    }
    if config.address.is_empty() {
        errors.push("address cannot be empty".to_string());
    }
    if config.db_backend.is_empty() {
        errors.push("db_backend cannot be empty".to_string());
    }

    validate_grpc_config(&config.grpc, &mut errors);
    validate_api_config(&config.api, &config.grpc, config.grpc_only, &mut errors);
    validate_versions(config, &mut errors);
    validate_observability_config(&config.observability, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationFailed(errors))
    }
}

fn validate_grpc_config(config: &GrpcConfig, errors: &mut Vec<String>) {
    if config.enable && !is_host_port(&config.address) {
        errors.push(format!(
            "grpc.address '{}' must be in host:port format",
            config.address
        ));
    }
}

fn validate_api_config(
    config: &ApiConfig,
    grpc: &GrpcConfig,
    grpc_only: bool,
    errors: &mut Vec<String>,
) {
    if config.enable && !is_host_port(&config.address) {
        errors.push(format!(
            "api.address '{}' must be in host:port format",
            config.address
        ));
    }

    // The API server proxies queries through the in-process gRPC server, so
    // it cannot run without one. grpc-only mode forces gRPC on.
    if config.enable && !grpc.enable && !grpc_only {
        errors.push("api.enable requires grpc.enable".to_string());
    }
}

fn validate_versions(config: &NodeConfig, errors: &mut Vec<String>) {
    let mut seen = HashSet::new();
    for version in &config.versions {
        if !seen.insert(version.app_version) {
            errors.push(format!(
                "versions contains duplicate app_version {}",
                version.app_version
            ));
        }
        match version.abci_version.as_str() {
            "v1" | "v2" => {}
            other => errors.push(format!(
                "versions[app_version={}] has unknown abci_version '{}', expected v1 or v2",
                version.app_version, other
            )),
        }
        if version.binary.is_empty() {
            errors.push(format!(
                "versions[app_version={}] binary cannot be empty",
                version.app_version
            ));
        }
    }
}

fn validate_observability_config(config: &ObservabilityConfig, errors: &mut Vec<String>) {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.log_level.to_lowercase().as_str()) {
        errors.push(format!(
            "observability.log_level '{}' is invalid. Valid levels: trace, debug, info, warn, error",
            config.log_level
        ));
    }

    let valid_formats = ["json", "pretty"];
    if !valid_formats.contains(&config.log_format.to_lowercase().as_str()) {
        errors.push(format!(
            "observability.log_format '{}' is invalid. Valid formats: json, pretty",
            config.log_format
        ));
    }
}

fn is_host_port(addr: &str) -> bool {
    match addr.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::EmbeddedVersionConfig;

    fn valid_config() -> NodeConfig {
        serde_yaml::from_str(
            r#"
home: "/tmp/meridian"
chain_id: meridian-1
"#,
        )
        .unwrap()
    }

    #[test]
    fn valid_config_passes() {
        assert!(validate_config(&valid_config()).is_ok());
    }

    #[test]
    fn empty_home_fails() {
        let mut config = valid_config();
        config.home = String::new();

        let err = validate_config(&config).unwrap_err();
        match err {
            ConfigError::ValidationFailed(errors) => {
                assert!(errors.iter().any(|e| e.contains("home")));
            }
            _ => panic!("expected ValidationFailed error"),
        }
    }

    #[test]
    fn api_requires_grpc() {
        let mut config = valid_config();
        config.api.enable = true;

        let err = validate_config(&config).unwrap_err();
        match err {
            ConfigError::ValidationFailed(errors) => {
                assert!(errors.iter().any(|e| e.contains("requires grpc.enable")));
            }
            _ => panic!("expected ValidationFailed error"),
        }

        // grpc-only implies gRPC, so the API no longer needs the flag.
        config.grpc_only = true;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn duplicate_versions_rejected() {
        let mut config = valid_config();
        for _ in 0..2 {
            config.versions.push(EmbeddedVersionConfig {
                app_version: 2,
                abci_version: "v1".to_string(),
                binary: "/usr/local/bin/meridiand-v1".to_string(),
                pre_handlers: vec![],
            });
        }

        let err = validate_config(&config).unwrap_err();
        match err {
            ConfigError::ValidationFailed(errors) => {
                assert!(errors.iter().any(|e| e.contains("duplicate app_version 2")));
            }
            _ => panic!("expected ValidationFailed error"),
        }
    }

    #[test]
    fn unknown_abci_version_rejected() {
        let mut config = valid_config();
        config.versions.push(EmbeddedVersionConfig {
            app_version: 2,
            abci_version: "v9".to_string(),
            binary: "/usr/local/bin/meridiand-v9".to_string(),
            pre_handlers: vec![],
        });

        let err = validate_config(&config).unwrap_err();
        match err {
            ConfigError::ValidationFailed(errors) => {
                assert!(errors.iter().any(|e| e.contains("unknown abci_version")));
            }
            _ => panic!("expected ValidationFailed error"),
        }
    }

    #[test]
    fn multiple_errors_collected() {
        let mut config = valid_config();
        config.chain_id = String::new();
        config.observability.log_level = "loud".to_string();
        config.grpc.enable = true;
        config.grpc.address = "not-an-addr".to_string();

        let err = validate_config(&config).unwrap_err();
        match err {
            ConfigError::ValidationFailed(errors) => {
                assert!(
                    errors.len() >= 3,
                    "expected at least 3 errors, got {}",
                    errors.len()
                );
            }
            _ => panic!("expected ValidationFailed error"),
        }
    }

    #[test]
    fn host_port_format() {
        assert!(is_host_port("127.0.0.1:9090"));
        assert!(is_host_port("localhost:1317"));
        assert!(!is_host_port("127.0.0.1"));
        assert!(!is_host_port(":9090"));
        assert!(!is_host_port("127.0.0.1:port"));
    }
}
