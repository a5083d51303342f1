//! Configuration parsing and structures

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::env::substitute_env_vars;

/// File name of the persisted engine configuration inside `engine.config_dir`
pub const ENGINE_CONFIG_FILE: &str = "rclone.conf";

// =============================================================================
// Top-level Config
// =============================================================================

/// Top-level daemon configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Engine process and control API settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Mount point layout
    #[serde(default)]
    pub mounts: MountSettings,

    /// Config file watcher settings
    #[serde(default)]
    pub watcher: WatcherConfig,

    /// Administrative HTTP endpoint
    #[serde(default)]
    pub api: ApiConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

/// How to launch and reach the supervised engine
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine executable
    pub binary: PathBuf,

    /// Arguments placed before the daemon-mode arguments
    pub args: Vec<String>,

    /// Loopback port the control API binds to
    pub port: u16,

    /// Base path of every control endpoint
    pub base_path: String,

    /// Directory holding the persisted engine configuration
    pub config_dir: PathBuf,

    /// Per-request timeout for control API calls
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Delay between readiness probes
    #[serde(with = "humantime_serde")]
    pub ready_interval: Duration,

    /// Readiness probes before giving up
    pub ready_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("rclone"),
            args: Vec::new(),
            port: 5572,
            base_path: "/cosmos/rclone".to_string(),
            config_dir: PathBuf::from("/config"),
            request_timeout: Duration::from_secs(30),
            ready_interval: Duration::from_secs(2),
            ready_attempts: 6,
        }
    }
}

impl EngineConfig {
    /// Path of the persisted engine configuration file
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(ENGINE_CONFIG_FILE)
    }
}

// =============================================================================
// Mounts
// =============================================================================

/// Where and how remotes are mounted
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MountSettings {
    /// Base directory for mount points
    pub base_dir: PathBuf,

    /// Base directory used when this process runs inside a container,
    /// pointing at a host-visible bind mount
    pub host_base_dir: PathBuf,

    /// Force container mode on or off. `None` detects it.
    pub inside_container: Option<bool>,

    /// Change ownership of mount points that carry an ownership hint
    pub apply_ownership: bool,
}

impl Default for MountSettings {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/mnt"),
            host_base_dir: PathBuf::from("/mnt/host/mnt"),
            inside_container: None,
            apply_ownership: true,
        }
    }
}

impl MountSettings {
    /// The base directory actually used for mount points
    pub fn effective_base_dir(&self) -> &Path {
        let inside = self
            .inside_container
            .unwrap_or_else(crate::env::is_inside_container);
        if inside {
            &self.host_base_dir
        } else {
            &self.base_dir
        }
    }
}

// =============================================================================
// Watcher / API
// =============================================================================

/// Config file watcher settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Interval of the polling fallback
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Administrative HTTP endpoint settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Listen address, `None` disables the endpoint
    pub listen: Option<SocketAddr>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: Some(SocketAddr::from(([127, 0, 0, 1], 5573))),
        }
    }
}

// =============================================================================
// Loading
// =============================================================================

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(path.clone(), e.to_string()))?;

        Self::from_str(&content)
    }

    /// Parse configuration from a YAML string, substituting `${VAR}` references first
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let content = substitute_env_vars(content)?;
        // An empty document deserializes to unit, not to a defaulted struct
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let engine = &self.engine;

        if engine.binary.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "engine.binary cannot be empty".to_string(),
            ));
        }

        if engine.port == 0 {
            return Err(ConfigError::ValidationError(
                "engine.port must be a fixed, non-zero port".to_string(),
            ));
        }

        if !engine.base_path.starts_with('/') {
            return Err(ConfigError::ValidationError(format!(
                "engine.base_path must start with '/': {:?}",
                engine.base_path
            )));
        }

        if engine.ready_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "engine.ready_attempts must be at least 1".to_string(),
            ));
        }

        if self.watcher.poll_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "watcher.poll_interval cannot be zero".to_string(),
            ));
        }

        if self.mounts.base_dir.as_os_str().is_empty()
            || self.mounts.host_base_dir.as_os_str().is_empty()
        {
            return Err(ConfigError::ValidationError(
                "mounts.base_dir and mounts.host_base_dir cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    ReadError(PathBuf, String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}
