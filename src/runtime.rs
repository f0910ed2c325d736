//! Ambient, process-wide settings — not part of the user's manifest.
//! Loaded by searching standard locations, with an environment-variable
//! override for the config home, then falling back to defaults for anything
//! unset.

use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "{config_dir}/devup.log".to_string()
}

fn default_sync_version() -> String {
    "1.0.0".to_string()
}

fn default_sync_download_base_url() -> String {
    "https://downloads.devup.dev/sync-engine".to_string()
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_file")]
    pub file: String,
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SyncEngineConfig {
    #[serde(default = "default_sync_version")]
    pub version: String,
    #[serde(default = "default_sync_download_base_url")]
    pub download_base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub sync: SyncEngineConfig,
    #[serde(default)]
    pub forward: ForwardConfig,
}

/// Root directory for everything devup persists: log file, state records,
/// sync engine binary/state. Honors a `DEVUP_CONFIG_HOME` override.
pub fn config_home() -> PathBuf {
    if let Ok(dir) = std::env::var("DEVUP_CONFIG_HOME") {
        return PathBuf::from(dir);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("devup")
}

/// Loads `<config_home>/config.yml` if present; otherwise returns defaults.
/// Unlike the manifest, an absent runtime config file is not an error —
/// every setting it could carry already has a sane default.
pub fn load_runtime_config() -> Result<RuntimeConfig> {
    let path = config_home().join("config.yml");
    if !path.exists() {
        return Ok(RuntimeConfig::default());
    }

    let content = std::fs::read_to_string(&path)?;
    let config: RuntimeConfig = serde_yaml::from_str(&content)?;
    Ok(config)
}

/// The forward-bind-address override, consumed directly from the
/// environment as well, for tests and containerized runs.
pub fn force_bind_address(config: &RuntimeConfig) -> String {
    std::env::var("DEVUP_FORCE_BIND_ADDRESS").unwrap_or_else(|_| config.forward.bind_address.clone())
}
