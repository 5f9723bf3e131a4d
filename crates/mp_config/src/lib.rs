//! `mp_config` - Configuration parsing and validation for ModelPilot
//!
//! This crate provides:
//! - TOML configuration parsing
//! - Default value handling
//! - Environment variable overrides
//! - Path expansion (`~/` to home directory)
//! - Auto-discovery from standard config paths

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Top-level configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MpConfig {
    /// Global settings
    pub global: GlobalConfig,

    /// Model registry settings
    pub registry: RegistryConfig,

    /// Blue-green deployment settings
    pub deployment: DeploymentConfig,

    /// Drift detection settings
    pub drift: DriftConfig,

    /// Feedback processing settings
    pub feedback: FeedbackConfig,

    /// Serving endpoint collaborator settings
    pub endpoint: EndpointConfig,
}

/// Global configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Root directory for all persisted state
    pub data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
        }
    }
}

/// Default data directory using XDG directories
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("modelpilot")
}

/// Model registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Maximum number of audit history entries to retain
    pub history_retention: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            history_retention: 1000,
        }
    }
}

/// Blue-green deployment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    /// Number of traffic-shift steps during gradual promotion
    pub promotion_steps: u32,

    /// Pause between promotion steps, in seconds (0 = no pause)
    pub step_wait_secs: u64,

    /// Run a health check on the staging slot between promotion steps and
    /// abort the promotion if it reports unhealthy
    pub health_gate: bool,

    /// Timeout for serving endpoint calls, in seconds
    pub endpoint_timeout_secs: u64,

    /// Maximum number of deployment history entries to retain
    pub history_retention: usize,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            promotion_steps: 5,
            step_wait_secs: 0,
            health_gate: false,
            endpoint_timeout_secs: 10,
            history_retention: 1000,
        }
    }
}

impl DeploymentConfig {
    /// Serving endpoint call timeout as a Duration
    #[must_use]
    pub fn endpoint_timeout(&self) -> Duration {
        Duration::from_secs(self.endpoint_timeout_secs)
    }

    /// Pause between gradual promotion steps as a Duration
    #[must_use]
    pub fn step_wait(&self) -> Duration {
        Duration::from_secs(self.step_wait_secs)
    }
}

/// Drift detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
    /// KL divergence threshold
    pub kl_threshold: f64,

    /// Population stability index threshold
    pub psi_threshold: f64,

    /// Mean shift threshold, in baseline standard deviations
    pub mean_shift_threshold: f64,

    /// Number of histogram buckets for feature statistics
    pub histogram_bins: usize,

    /// Monitoring window recorded on reports, in hours
    pub monitoring_window_hours: u64,

    /// Fraction of drifted features above which drift is called systematic
    pub systematic_ratio: f64,

    /// Maximum number of drift alerts to retain
    pub alert_retention: usize,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            kl_threshold: 0.1,
            psi_threshold: 0.2,
            mean_shift_threshold: 2.0,
            histogram_bins: 20,
            monitoring_window_hours: 24,
            systematic_ratio: 0.3,
            alert_retention: 500,
        }
    }
}

/// Feedback processing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    /// Only records newer than this many days enter a training dataset
    pub min_recency_days: i64,

    /// Sample weight assigned to operator overrides
    pub override_weight: f64,

    /// Sample weight assigned to job outcomes
    pub outcome_weight: f64,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            min_recency_days: 90,
            override_weight: 2.0,
            outcome_weight: 1.0,
        }
    }
}

/// Serving endpoint collaborator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Whether a real serving endpoint is wired up. When false the control
    /// plane runs against a no-op endpoint that accepts every call.
    pub enabled: bool,

    /// Base URL of the serving endpoint
    pub base_url: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "http://127.0.0.1:8500".to_string(),
        }
    }
}

/// Expand tilde in path to home directory
#[must_use]
pub fn expand_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    if let Some(stripped) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    } else if path_str == "~" && let Some(home) = dirs::home_dir() {
        return home;
    }
    path.to_path_buf()
}

impl MpConfig {
    /// Standard config file paths, in order of precedence
    #[must_use]
    pub fn config_paths() -> Vec<PathBuf> {
        let mut paths = vec![
            // 1. Current directory (project-local)
            PathBuf::from("modelpilot.toml"),
        ];

        // 2. User config directory (~/.config/modelpilot/modelpilot.toml)
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("modelpilot").join("modelpilot.toml"));
        }

        // 3. System config
        paths.push(PathBuf::from("/etc/modelpilot/modelpilot.toml"));

        paths
    }

    /// Discover and load configuration from standard paths.
    ///
    /// Returns defaults if no config file is found.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if a discovered config file cannot be loaded.
    pub fn discover() -> Result<Self, ConfigError> {
        for path in Self::config_paths() {
            if path.exists() {
                info!(path = %path.display(), "Loading config from");
                return Self::load(&path);
            }
        }

        info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Discover config and apply environment variable overrides.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if config discovery or validation fails.
    pub fn discover_with_env() -> Result<Self, ConfigError> {
        let mut config = Self::discover()?;
        config.apply_env_overrides();
        config.expand_all_paths();
        Ok(config)
    }

    /// Load configuration from a specific TOML file.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if the file cannot be read, parsed, or validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: MpConfig = toml::from_str(&content)?;
        config.expand_all_paths();
        config.validate()?;
        Ok(config)
    }

    /// Expand all paths in configuration (resolve `~/` to home directory)
    pub fn expand_all_paths(&mut self) {
        self.global.data_dir = expand_path(&self.global.data_dir);
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("MP_DATA_DIR") {
            self.global.data_dir = expand_path(&PathBuf::from(val));
        }
        if let Ok(val) = std::env::var("MP_LOG_LEVEL") {
            self.global.log_level = val;
        }
        if let Ok(val) = std::env::var("MP_ENDPOINT_URL") {
            self.endpoint.base_url = val;
            self.endpoint.enabled = true;
        }
        if let Ok(val) = std::env::var("MP_PROMOTION_STEPS")
            && let Ok(steps) = val.parse()
        {
            self.deployment.promotion_steps = steps;
        }
    }

    /// Validate configuration.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] when validation rules are violated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.global.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.global.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.deployment.promotion_steps == 0 {
            return Err(ConfigError::ValidationError(
                "deployment.promotion_steps must be > 0".to_string(),
            ));
        }

        if self.deployment.endpoint_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "deployment.endpoint_timeout_secs must be > 0".to_string(),
            ));
        }

        if self.drift.kl_threshold <= 0.0
            || self.drift.psi_threshold <= 0.0
            || self.drift.mean_shift_threshold <= 0.0
        {
            return Err(ConfigError::ValidationError(
                "drift thresholds must be > 0".to_string(),
            ));
        }

        if self.drift.histogram_bins == 0 {
            return Err(ConfigError::ValidationError(
                "drift.histogram_bins must be > 0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.drift.systematic_ratio) {
            return Err(ConfigError::ValidationError(
                "drift.systematic_ratio must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.feedback.min_recency_days <= 0 {
            return Err(ConfigError::ValidationError(
                "feedback.min_recency_days must be > 0".to_string(),
            ));
        }

        if self.feedback.override_weight <= 0.0 || self.feedback.outcome_weight <= 0.0 {
            return Err(ConfigError::ValidationError(
                "feedback sample weights must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Get the serving endpoint call timeout as a Duration
    #[must_use]
    pub fn endpoint_timeout(&self) -> Duration {
        self.deployment.endpoint_timeout()
    }

    /// Get the pause between gradual promotion steps as a Duration
    #[must_use]
    pub fn step_wait(&self) -> Duration {
        self.deployment.step_wait()
    }
}
