use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use meridian_operations::config::{ensure_config_exists, load_config, validate_config, NodeConfig};
use meridian_operations::ConfigError;

#[derive(Debug, Parser)]
#[command(name = "meridiand", about = "Meridian consensus node", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Write a default config file under the home directory
    Init(InitArgs),
    /// Run the node
    Start(StartArgs),
}

#[derive(Debug, Args)]
pub struct InitArgs {
    /// Home directory
    #[arg(long)]
    pub home: Option<String>,
}

#[derive(Debug, Clone, Default, Args)]
pub struct StartArgs {
    /// Home directory override
    #[arg(long)]
    pub home: Option<String>,

    /// Config file path (defaults to <home>/config.yaml, auto-generated if
    /// missing)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Disable the consensus node and force the gRPC server on
    #[arg(long)]
    pub grpc_only: bool,

    /// Trace sink path override
    #[arg(long)]
    pub trace_store: Option<String>,

    /// Log level override
    #[arg(long)]
    pub log_level: Option<String>,

    /// Enable the in-process gRPC server
    #[arg(long)]
    pub grpc_enable: bool,

    /// Enable the API server
    #[arg(long)]
    pub api_enable: bool,
}

/// Default home directory: `~/.meridian`.
pub fn default_home() -> String {
    match std::env::var("HOME") {
        Ok(home) => format!("{home}/.meridian"),
        Err(_) => "./.meridian".to_string(),
    }
}

/// Resolve a NodeConfig from the config file plus CLI overrides.
pub fn resolve_config(args: &StartArgs) -> Result<NodeConfig, ConfigError> {
    let home = args.home.clone().unwrap_or_else(default_home);
    let path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(&home).join("config.yaml"));

    ensure_config_exists(&path, &home)?;
    let mut cfg = load_config(&path)?;

    // CLI overrides (highest priority)
    if let Some(home) = &args.home {
        cfg.home = home.clone();
    }
    if args.grpc_only {
        cfg.grpc_only = true;
    }
    if let Some(trace_store) = &args.trace_store {
        cfg.trace_store = trace_store.clone();
    }
    if let Some(log_level) = &args.log_level {
        cfg.observability.log_level = log_level.clone();
    }
    if args.grpc_enable {
        cfg.grpc.enable = true;
    }
    if args.api_enable {
        cfg.api.enable = true;
    }

    // overrides can invalidate a valid file, e.g. --api-enable without gRPC
    validate_config(&cfg)?;

    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn resolve_config_generates_and_applies_overrides() {
        let dir = TempDir::new().unwrap();
        let home = dir.path().display().to_string();

        let args = StartArgs {
            home: Some(home.clone()),
            grpc_only: true,
            trace_store: Some("/tmp/trace.log".to_string()),
            log_level: Some("debug".to_string()),
            grpc_enable: true,
            ..Default::default()
        };

        let cfg = resolve_config(&args).unwrap();
        assert_eq!(cfg.home, home);
        assert!(cfg.grpc_only);
        assert!(cfg.grpc.enable);
        assert_eq!(cfg.trace_store, "/tmp/trace.log");
        assert_eq!(cfg.observability.log_level, "debug");
        assert!(dir.path().join("config.yaml").exists());
    }

    #[test]
    fn resolve_config_without_overrides_keeps_file_values() {
        let dir = TempDir::new().unwrap();
        let home = dir.path().display().to_string();

        let args = StartArgs {
            home: Some(home),
            ..Default::default()
        };

        let cfg = resolve_config(&args).unwrap();
        assert!(!cfg.grpc_only);
        assert!(!cfg.grpc.enable);
        assert_eq!(cfg.observability.log_level, "info");
    }
}
