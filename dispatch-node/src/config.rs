//! Configuration management for the node binary.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use dispatch_core::backup::VeState;
use dispatch_core::task::DEFAULT_TERMINATE_TIMEOUT;

use crate::cli::Args;

/// Configuration file looked up when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vedispatch/node.yaml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node-specific configuration
    pub node: NodeConfig,
    /// Task framework configuration
    pub tasks: TasksConfig,
    /// Backup-device configuration
    pub backup: BackupConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| "Failed to parse config file")?;

        Ok(config)
    }

    /// Defaults with CLI arguments applied.
    pub fn default_with_cli(args: &Args) -> Self {
        Self::default().with_cli_overrides(args)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref node_id) = args.node_id {
            self.node.id = Some(node_id.clone());
        }

        if let Some(secs) = args.shutdown_timeout {
            self.tasks.shutdown_timeout_secs = secs;
        }

        if args.json_logs {
            self.logging.format = LogFormat::Json;
        }

        self
    }
}

/// Node-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Unique node ID (auto-generated if not set)
    pub id: Option<String>,
    /// VM directory the node's own session works with
    pub vm_directory: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: None,
            vm_directory: "default".to_string(),
        }
    }
}

impl NodeConfig {
    /// Get the node ID, generating one if not set.
    pub fn get_id(&self) -> String {
        self.id.clone().unwrap_or_else(|| {
            uuid::Uuid::new_v4().to_string()
        })
    }
}

/// Task framework configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TasksConfig {
    /// How long shutdown waits for tasks to stop on their own
    pub shutdown_timeout_secs: u64,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_secs: DEFAULT_TERMINATE_TIMEOUT.as_secs(),
        }
    }
}

impl TasksConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Backup-device configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Backend type
    pub backend: BackupBackendKind,
    /// Run state reported for each VE, by uuid. Unlisted VEs are stopped.
    pub ve_states: HashMap<String, VeState>,
}

/// Backup backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupBackendKind {
    /// In-memory backend for testing/development
    #[default]
    Mock,
}

/// Logging configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}
