#![deny(clippy::pedantic, unsafe_code)]
#![allow(clippy::module_name_repetitions)]

//! Configuration management for the build operation tracker
//!
//! This crate handles loading and merging configuration from:
//! - Default values (hard-coded)
//! - Configuration file (~/.config/buildops/config.toml)
//! - Environment variables
//! - CLI flags (applied by the binary)

use buildops_errors::{ConfigError, Error};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub tracking: TrackingConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub classifier: ClassifierConfig,

    #[serde(default)]
    pub queue: QueueConfig,
}

/// Registry and context behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingConfig {
    /// Evict records as soon as their finish event was delivered
    #[serde(default)]
    pub evict_on_finish: bool,
    /// Reject ambient parents that are no longer running
    #[serde(default = "default_true")]
    pub validate_resumed_context: bool,
}

/// Listener dispatch behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_true")]
    pub isolate_listener_panics: bool,
}

/// Failure classification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Failure codes always classified as expected
    #[serde(default = "default_expected_codes")]
    pub expected_codes: Vec<String>,
}

/// Parallel queue sizing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct QueueConfig {
    #[serde(default)]
    pub max_workers: usize, // 0 = auto-detect
}

// Default implementations

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            evict_on_finish: false,
            validate_resumed_context: true,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            isolate_listener_panics: true,
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            expected_codes: default_expected_codes(),
        }
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_expected_codes() -> Vec<String> {
    vec![
        "build.validation_failed".to_string(),
        "build.cancelled".to_string(),
    ]
}

impl Config {
    /// Get the default config file path
    ///
    /// # Errors
    ///
    /// Returns an error if the system config directory cannot be determined.
    pub fn default_path() -> Result<PathBuf, Error> {
        let config_dir = dirs::config_dir().ok_or_else(|| ConfigError::NotFound {
            path: "config directory".to_string(),
        })?;
        Ok(config_dir.join("buildops").join("config.toml"))
    }

    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or if the file contents
    /// contain invalid TOML syntax that cannot be parsed.
    pub async fn load_from_file(path: &Path) -> Result<Self, Error> {
        let contents = fs::read_to_string(path)
            .await
            .map_err(|_| ConfigError::NotFound {
                path: path.display().to_string(),
            })?;

        Self::from_toml_str(&contents)
    }

    /// Parse configuration from TOML text
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid TOML for this structure.
    pub fn from_toml_str(contents: &str) -> Result<Self, Error> {
        toml::from_str(contents)
            .map_err(|e| ConfigError::ParseError {
                message: e.to_string(),
            })
            .map_err(Into::into)
    }

    /// Load configuration with fallback to defaults
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file exists but cannot be read
    /// or contains invalid TOML syntax.
    pub async fn load() -> Result<Self, Error> {
        let config_path = Self::default_path()?;

        if config_path.exists() {
            Self::load_from_file(&config_path).await
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from an optional path or use default
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be read or parsed
    pub async fn load_or_default(path: Option<&Path>) -> Result<Self, Error> {
        match path {
            Some(config_path) => Self::load_from_file(config_path).await,
            None => Self::load().await,
        }
    }

    /// Render the configuration as TOML
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml_string(&self) -> Result<String, Error> {
        toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError {
                error: e.to_string(),
            })
            .map_err(Into::into)
    }

    /// Merge with environment variables
    ///
    /// # Errors
    ///
    /// Returns an error if environment variables contain invalid values
    /// that cannot be parsed into the expected types.
    pub fn merge_env(&mut self) -> Result<(), Error> {
        if let Some(value) = env_flag("BUILDOPS_EVICT_ON_FINISH")? {
            self.tracking.evict_on_finish = value;
        }

        if let Some(value) = env_flag("BUILDOPS_VALIDATE_CONTEXT")? {
            self.tracking.validate_resumed_context = value;
        }

        if let Some(value) = env_flag("BUILDOPS_ISOLATE_PANICS")? {
            self.dispatch.isolate_listener_panics = value;
        }

        // BUILDOPS_EXPECTED_CODES
        if let Ok(codes) = std::env::var("BUILDOPS_EXPECTED_CODES") {
            self.classifier.expected_codes = codes
                .split(',')
                .map(str::trim)
                .filter(|code| !code.is_empty())
                .map(str::to_string)
                .collect();
        }

        // BUILDOPS_MAX_WORKERS
        if let Ok(workers) = std::env::var("BUILDOPS_MAX_WORKERS") {
            self.queue.max_workers = workers.parse().map_err(|_| ConfigError::InvalidValue {
                field: "BUILDOPS_MAX_WORKERS".to_string(),
                value: workers,
            })?;
        }

        Ok(())
    }
}

fn env_flag(var: &str) -> Result<Option<bool>, Error> {
    let Ok(value) = std::env::var(var) else {
        return Ok(None);
    };
    match value.as_str() {
        "true" | "1" | "yes" => Ok(Some(true)),
        "false" | "0" | "no" => Ok(Some(false)),
        _ => Err(ConfigError::InvalidValue {
            field: var.to_string(),
            value,
        }
        .into()),
    }
}

/// Calculate queue workers based on CPU count
#[must_use]
pub fn calculate_workers(config_value: usize) -> usize {
    if config_value > 0 {
        config_value // User override
    } else {
        // Use 75% of CPUs, minimum 1
        let cpus = num_cpus::get();
        (cpus * 3 / 4).max(1)
    }
}
