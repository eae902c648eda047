//! `weave.toml` loading.
//!
//! Every section is optional: a missing or empty file yields the defaults.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use weave_core::{WeaveError, WeaveResult};
use weave_orchestrator::OrchestratorConfig;

/// Top-level CLI configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WeaveConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub state: StateConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    /// Used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StateConfig {
    /// JSON file the shared state store is loaded from and flushed to.
    #[serde(default)]
    pub persistence_path: Option<PathBuf>,
}

/// Read and parse a TOML config file.
pub fn parse_config(path: &Path) -> WeaveResult<WeaveConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        WeaveError::Config(format!(
            "Failed to read config '{}': {}",
            path.display(),
            e
        ))
    })?;
    toml::from_str(&content).map_err(|e| {
        WeaveError::Config(format!(
            "Failed to parse config '{}': {}",
            path.display(),
            e
        ))
    })
}

/// Like [`parse_config`], but a file that does not exist means defaults.
pub fn load_or_default(path: &Path) -> WeaveResult<WeaveConfig> {
    if path.exists() {
        parse_config(path)
    } else {
        Ok(WeaveConfig::default())
    }
}
