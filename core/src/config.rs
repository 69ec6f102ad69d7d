use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ImageError, Result};

/// Runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Root directory of the local image store
    pub store_dir: PathBuf,

    /// What to do when a single-platform image does not match the requested platform
    pub platform_mismatch: MismatchPolicy,

    /// Registry access settings
    pub registry: RegistryConfig,

    /// Log level
    pub log_level: LogLevel,

    /// Capacity of the image event channel
    pub event_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            store_dir: default_store_dir(),
            platform_mismatch: MismatchPolicy::Warn,
            registry: RegistryConfig::default(),
            log_level: LogLevel::Warn,
            event_capacity: 256,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a YAML file.
    ///
    /// Missing fields take their default values.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            ImageError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: RuntimeConfig = serde_yaml::from_str(&data)?;
        Ok(config)
    }

    /// Default configuration rooted at the given store directory.
    pub fn with_store_dir(store_dir: impl Into<PathBuf>) -> Self {
        Self {
            store_dir: store_dir.into(),
            ..Self::default()
        }
    }
}

/// Default store location (~/.stevedore/images).
fn default_store_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".stevedore"))
        .unwrap_or_else(|| PathBuf::from(".stevedore"))
        .join("images")
}

/// Handling of a platform mismatch on a single-platform image.
///
/// Manifest lists never mismatch: an entry either matches or the pull fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MismatchPolicy {
    /// Log a warning and keep the image
    #[default]
    Warn,
    /// Fail the operation with `PlatformMismatch`
    Error,
}

/// Registry access settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Talk plain HTTP instead of HTTPS
    pub insecure: bool,

    /// Username (falls back to REGISTRY_USERNAME)
    pub username: Option<String>,

    /// Password (falls back to REGISTRY_PASSWORD)
    pub password: Option<String>,
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(format!(
                "unknown log level: '{}' (supported: debug, info, warn, error)",
                other
            )),
        }
    }
}
