// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Configuration file handling.
//!
//! Daemon timing, file locations and the supported-model allow-list, stored
//! as TOML. Curve parameters are not configured here; they live in the
//! settings record and are edited through shared memory.
//! Default path: `/etc/ecfan/config.toml`

use crate::error::{FanError, Result};
use crate::settings::DEFAULT_SETTINGS_PATH;
use crate::shm::DEFAULT_SHM_NAME;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/ecfan/config.toml";

/// Default control loop period in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Default sleep slice between shutdown checks, in milliseconds.
pub const DEFAULT_SLEEP_SLICE_MS: u64 = 100;

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Daemon settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Host model checks.
    #[serde(default)]
    pub platform: PlatformConfig,
}

/// Daemon-specific settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaemonConfig {
    /// Control loop period, in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Granularity of the loop sleep; bounds shutdown latency.
    #[serde(default = "default_sleep_slice")]
    pub sleep_slice_ms: u64,

    /// Persisted settings record.
    #[serde(default = "default_settings_path")]
    pub settings_path: PathBuf,

    /// Name of the shared memory segment.
    #[serde(default = "default_shm_name")]
    pub shm_name: String,

    /// Whether to hand fans back to EC automatic mode on exit.
    #[serde(default = "default_true")]
    pub restore_auto_on_exit: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            sleep_slice_ms: DEFAULT_SLEEP_SLICE_MS,
            settings_path: default_settings_path(),
            shm_name: default_shm_name(),
            restore_auto_on_exit: true,
        }
    }
}

impl DaemonConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn sleep_slice(&self) -> Duration {
        Duration::from_millis(self.sleep_slice_ms)
    }
}

/// Pre-flight model check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlatformConfig {
    /// Refuse to start on hosts that are not listed in `supported`.
    #[serde(default = "default_true")]
    pub check_model: bool,

    /// Models whose EC register map matches the built-in constants.
    #[serde(default = "default_supported_models")]
    pub supported: Vec<SupportedModel>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            check_model: true,
            supported: default_supported_models(),
        }
    }
}

/// A DMI vendor / product pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SupportedModel {
    pub vendor: String,
    pub product: String,
}

impl Config {
    /// Reject values the control loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.daemon.poll_interval_ms == 0 {
            return Err(FanError::Configuration(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.daemon.sleep_slice_ms == 0 {
            return Err(FanError::Configuration(
                "sleep_slice_ms must be greater than zero".to_string(),
            ));
        }
        if self.daemon.shm_name.is_empty() || self.daemon.shm_name.contains('/') {
            return Err(FanError::Configuration(format!(
                "Invalid shared memory name '{}'",
                self.daemon.shm_name
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Load / Save
// ---------------------------------------------------------------------------

/// Load config from a TOML file, or return the default if the file doesn't exist.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        log::info!("No config file at {}, using defaults", path.display());
        return Ok(Config::default());
    }

    let contents = fs::read_to_string(path).map_err(|e| {
        FanError::Configuration(format!("Failed to read {}: {e}", path.display()))
    })?;
    let config: Config = toml::from_str(&contents)
        .map_err(|e| FanError::Configuration(format!("Failed to parse config: {e}")))?;
    config.validate()?;

    log::info!("Loaded config from {}", path.display());
    Ok(config)
}

/// Save config to a TOML file, creating parent directories if needed.
pub fn save_config(path: &Path, config: &Config) -> Result<()> {
    let io_err =
        |e: std::io::Error| FanError::Configuration(format!("Failed to write {}: {e}", path.display()));

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let contents = toml::to_string_pretty(config)
        .map_err(|e| FanError::Configuration(format!("Failed to serialize config: {e}")))?;

    fs::write(path, contents).map_err(io_err)?;
    log::info!("Saved config to {}", path.display());
    Ok(())
}

/// Resolve the config file path from CLI arg or default.
pub fn resolve_config_path(cli_path: Option<&str>) -> PathBuf {
    cli_path
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_sleep_slice() -> u64 {
    DEFAULT_SLEEP_SLICE_MS
}

fn default_settings_path() -> PathBuf {
    PathBuf::from(DEFAULT_SETTINGS_PATH)
}

fn default_shm_name() -> String {
    DEFAULT_SHM_NAME.to_string()
}

fn default_supported_models() -> Vec<SupportedModel> {
    vec![SupportedModel {
        vendor: "Acer".to_string(),
        product: "Predator PHN16-72".to_string(),
    }]
}

fn default_true() -> bool {
    true
}
