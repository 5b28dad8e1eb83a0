//! Control-plane configuration.
//!
//! Every setting has a default and can be overridden by a `REELFORGE_*`
//! environment variable. The CLI layers its own flags on top.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::analytics::DriftConfig;
use crate::replenish::ReplenishConfig;
use crate::scheduler::DispatchConfig;

use super::orchestrator::OrchestratorConfig;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the whole control plane.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    // Storage
    /// SQLite database file.
    pub database_path: String,
    /// Root for assembled videos and training manifests.
    pub output_dir: PathBuf,
    /// Directory relative image file names resolve against.
    pub image_root: PathBuf,

    // External services
    /// Generation backend base URL.
    pub backend_url: String,
    /// Timeout for backend, scorer and media server requests.
    pub request_timeout: Duration,
    /// OpenAI-compatible endpoint used by the vision scorer.
    pub llm_api_base: String,
    pub llm_api_key: Option<String>,
    pub scorer_model: String,
    /// Whether the dispatcher scores new images.
    pub scoring_enabled: bool,
    /// Media server base URL. Publishing is unavailable without it.
    pub media_url: Option<String>,
    pub media_api_key: Option<String>,
    pub ffmpeg_binary: PathBuf,
    pub frame_rate: u32,

    // Loops
    pub orchestrator_interval: Duration,
    pub replenish_interval: Duration,
    pub dispatch_interval: Duration,
    pub shutdown_timeout: Duration,

    // Replenishment
    pub replenish_target: u32,
    pub replenish_enabled: bool,
    pub max_batch_size: u32,
    pub max_outstanding_batches: u32,
    pub default_checkpoint: String,
    pub default_sampler: String,
    pub default_steps: u32,

    // Dispatch
    pub dispatch_batch_limit: u32,
    pub scoring_limit: u32,
    pub score_max_attempts: u32,
    pub handle_grace: Duration,

    // Quality
    pub drift_window: usize,
    pub drift_threshold: f64,
    pub drift_min_samples: usize,
    pub consistency_points: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        let replenish = ReplenishConfig::default();
        let dispatch = DispatchConfig::default();
        let drift = DriftConfig::default();
        Self {
            database_path: "reelforge.db".to_string(),
            output_dir: PathBuf::from("output"),
            image_root: dispatch.image_root,

            backend_url: "http://localhost:8188".to_string(),
            request_timeout: Duration::from_secs(30),
            llm_api_base: "http://localhost:4000/v1".to_string(),
            llm_api_key: None,
            scorer_model: "gpt-4o-mini".to_string(),
            scoring_enabled: true,
            media_url: None,
            media_api_key: None,
            ffmpeg_binary: PathBuf::from("ffmpeg"),
            frame_rate: 24,

            orchestrator_interval: Duration::from_secs(30),
            replenish_interval: Duration::from_secs(60),
            dispatch_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),

            replenish_target: replenish.default_target,
            replenish_enabled: replenish.enabled_by_default,
            max_batch_size: replenish.max_batch_size,
            max_outstanding_batches: replenish.max_outstanding_batches,
            default_checkpoint: replenish.default_checkpoint,
            default_sampler: replenish.default_sampler,
            default_steps: replenish.default_steps,

            dispatch_batch_limit: dispatch.batch_limit,
            scoring_limit: dispatch.scoring_limit,
            score_max_attempts: dispatch.score_max_attempts,
            handle_grace: dispatch.handle_grace,

            drift_window: drift.window,
            drift_threshold: drift.threshold,
            drift_min_samples: drift.min_recent_samples,
            consistency_points: OrchestratorConfig::default().consistency_points,
        }
    }
}

impl AppConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `REELFORGE_DATABASE`: SQLite file (default: reelforge.db)
    /// - `REELFORGE_OUTPUT_DIR`: output root (default: output)
    /// - `REELFORGE_IMAGE_ROOT`: image directory (default: output/images)
    /// - `REELFORGE_BACKEND_URL`: generation backend (default: http://localhost:8188)
    /// - `REELFORGE_REQUEST_TIMEOUT_SECS`: external request timeout (default: 30)
    /// - `REELFORGE_LLM_API_BASE`, `REELFORGE_LLM_API_KEY`, `REELFORGE_SCORER_MODEL`
    /// - `REELFORGE_SCORING_ENABLED`: score new images (default: true)
    /// - `REELFORGE_MEDIA_URL`, `REELFORGE_MEDIA_API_KEY`
    /// - `REELFORGE_FFMPEG`: ffmpeg binary (default: ffmpeg)
    /// - `REELFORGE_FRAME_RATE`: output frame rate (default: 24)
    /// - `REELFORGE_ORCHESTRATOR_INTERVAL_SECS` (default: 30)
    /// - `REELFORGE_REPLENISH_INTERVAL_SECS` (default: 60)
    /// - `REELFORGE_DISPATCH_INTERVAL_SECS` (default: 5)
    /// - `REELFORGE_SHUTDOWN_TIMEOUT_SECS` (default: 30)
    /// - `REELFORGE_REPLENISH_TARGET` (default: 40)
    /// - `REELFORGE_REPLENISH_ENABLED` (default: true)
    /// - `REELFORGE_MAX_BATCH_SIZE` (default: 5)
    /// - `REELFORGE_MAX_OUTSTANDING_BATCHES` (default: 1)
    /// - `REELFORGE_DEFAULT_CHECKPOINT`, `REELFORGE_DEFAULT_SAMPLER`, `REELFORGE_DEFAULT_STEPS`
    /// - `REELFORGE_DISPATCH_BATCH_LIMIT` (default: 20)
    /// - `REELFORGE_SCORING_LIMIT` (default: 5)
    /// - `REELFORGE_SCORE_MAX_ATTEMPTS` (default: 3)
    /// - `REELFORGE_HANDLE_GRACE_SECS` (default: 120)
    /// - `REELFORGE_DRIFT_WINDOW`, `REELFORGE_DRIFT_THRESHOLD`, `REELFORGE_DRIFT_MIN_SAMPLES`
    /// - `REELFORGE_CONSISTENCY_POINTS` (default: 3)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let secs = |key: &str| -> Result<Option<Duration>, ConfigError> {
            lookup(key)
                .map(|val| parse_env_value::<u64>(&val, key).map(Duration::from_secs))
                .transpose()
        };

        // Storage
        if let Some(val) = lookup("REELFORGE_DATABASE") {
            config.database_path = val;
        }
        if let Some(val) = lookup("REELFORGE_OUTPUT_DIR") {
            config.output_dir = PathBuf::from(val);
        }
        if let Some(val) = lookup("REELFORGE_IMAGE_ROOT") {
            config.image_root = PathBuf::from(val);
        }

        // External services
        if let Some(val) = lookup("REELFORGE_BACKEND_URL") {
            config.backend_url = val;
        }
        if let Some(timeout) = secs("REELFORGE_REQUEST_TIMEOUT_SECS")? {
            config.request_timeout = timeout;
        }
        if let Some(val) = lookup("REELFORGE_LLM_API_BASE") {
            config.llm_api_base = val;
        }
        if let Some(val) = lookup("REELFORGE_LLM_API_KEY") {
            config.llm_api_key = non_empty(val);
        }
        if let Some(val) = lookup("REELFORGE_SCORER_MODEL") {
            config.scorer_model = val;
        }
        if let Some(val) = lookup("REELFORGE_SCORING_ENABLED") {
            config.scoring_enabled = parse_env_bool(&val, "REELFORGE_SCORING_ENABLED")?;
        }
        if let Some(val) = lookup("REELFORGE_MEDIA_URL") {
            config.media_url = non_empty(val);
        }
        if let Some(val) = lookup("REELFORGE_MEDIA_API_KEY") {
            config.media_api_key = non_empty(val);
        }
        if let Some(val) = lookup("REELFORGE_FFMPEG") {
            config.ffmpeg_binary = PathBuf::from(val);
        }
        if let Some(val) = lookup("REELFORGE_FRAME_RATE") {
            config.frame_rate = parse_env_value(&val, "REELFORGE_FRAME_RATE")?;
        }

        // Loops
        if let Some(interval) = secs("REELFORGE_ORCHESTRATOR_INTERVAL_SECS")? {
            config.orchestrator_interval = interval;
        }
        if let Some(interval) = secs("REELFORGE_REPLENISH_INTERVAL_SECS")? {
            config.replenish_interval = interval;
        }
        if let Some(interval) = secs("REELFORGE_DISPATCH_INTERVAL_SECS")? {
            config.dispatch_interval = interval;
        }
        if let Some(timeout) = secs("REELFORGE_SHUTDOWN_TIMEOUT_SECS")? {
            config.shutdown_timeout = timeout;
        }

        // Replenishment
        if let Some(val) = lookup("REELFORGE_REPLENISH_TARGET") {
            config.replenish_target = parse_env_value(&val, "REELFORGE_REPLENISH_TARGET")?;
        }
        if let Some(val) = lookup("REELFORGE_REPLENISH_ENABLED") {
            config.replenish_enabled = parse_env_bool(&val, "REELFORGE_REPLENISH_ENABLED")?;
        }
        if let Some(val) = lookup("REELFORGE_MAX_BATCH_SIZE") {
            config.max_batch_size = parse_env_value(&val, "REELFORGE_MAX_BATCH_SIZE")?;
        }
        if let Some(val) = lookup("REELFORGE_MAX_OUTSTANDING_BATCHES") {
            config.max_outstanding_batches =
                parse_env_value(&val, "REELFORGE_MAX_OUTSTANDING_BATCHES")?;
        }
        if let Some(val) = lookup("REELFORGE_DEFAULT_CHECKPOINT") {
            config.default_checkpoint = val;
        }
        if let Some(val) = lookup("REELFORGE_DEFAULT_SAMPLER") {
            config.default_sampler = val;
        }
        if let Some(val) = lookup("REELFORGE_DEFAULT_STEPS") {
            config.default_steps = parse_env_value(&val, "REELFORGE_DEFAULT_STEPS")?;
        }

        // Dispatch
        if let Some(val) = lookup("REELFORGE_DISPATCH_BATCH_LIMIT") {
            config.dispatch_batch_limit = parse_env_value(&val, "REELFORGE_DISPATCH_BATCH_LIMIT")?;
        }
        if let Some(val) = lookup("REELFORGE_SCORING_LIMIT") {
            config.scoring_limit = parse_env_value(&val, "REELFORGE_SCORING_LIMIT")?;
        }
        if let Some(val) = lookup("REELFORGE_SCORE_MAX_ATTEMPTS") {
            config.score_max_attempts = parse_env_value(&val, "REELFORGE_SCORE_MAX_ATTEMPTS")?;
        }
        if let Some(grace) = secs("REELFORGE_HANDLE_GRACE_SECS")? {
            config.handle_grace = grace;
        }

        // Quality
        if let Some(val) = lookup("REELFORGE_DRIFT_WINDOW") {
            config.drift_window = parse_env_value(&val, "REELFORGE_DRIFT_WINDOW")?;
        }
        if let Some(val) = lookup("REELFORGE_DRIFT_THRESHOLD") {
            config.drift_threshold = parse_env_value(&val, "REELFORGE_DRIFT_THRESHOLD")?;
        }
        if let Some(val) = lookup("REELFORGE_DRIFT_MIN_SAMPLES") {
            config.drift_min_samples = parse_env_value(&val, "REELFORGE_DRIFT_MIN_SAMPLES")?;
        }
        if let Some(val) = lookup("REELFORGE_CONSISTENCY_POINTS") {
            config.consistency_points = parse_env_value(&val, "REELFORGE_CONSISTENCY_POINTS")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_path.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "database_path cannot be empty".to_string(),
            ));
        }

        if self.backend_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "backend_url cannot be empty".to_string(),
            ));
        }

        if self.request_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "request_timeout must be greater than 0".to_string(),
            ));
        }

        if self.scoring_enabled && self.scorer_model.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "scorer_model cannot be empty while scoring is enabled".to_string(),
            ));
        }

        if self.scoring_enabled && self.score_max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "score_max_attempts must be greater than 0 while scoring is enabled".to_string(),
            ));
        }

        if self.frame_rate == 0 {
            return Err(ConfigError::ValidationFailed(
                "frame_rate must be greater than 0".to_string(),
            ));
        }

        for (name, interval) in [
            ("orchestrator_interval", self.orchestrator_interval),
            ("replenish_interval", self.replenish_interval),
            ("dispatch_interval", self.dispatch_interval),
        ] {
            if interval.is_zero() {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        if self.max_batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_batch_size must be greater than 0".to_string(),
            ));
        }

        if self.max_outstanding_batches == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_outstanding_batches must be greater than 0".to_string(),
            ));
        }

        if self.default_checkpoint.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "default_checkpoint cannot be empty".to_string(),
            ));
        }

        if self.default_steps == 0 {
            return Err(ConfigError::ValidationFailed(
                "default_steps must be greater than 0".to_string(),
            ));
        }

        if self.dispatch_batch_limit == 0 {
            return Err(ConfigError::ValidationFailed(
                "dispatch_batch_limit must be greater than 0".to_string(),
            ));
        }

        if self.drift_window == 0 {
            return Err(ConfigError::ValidationFailed(
                "drift_window must be greater than 0".to_string(),
            ));
        }

        if self.drift_min_samples > self.drift_window {
            return Err(ConfigError::ValidationFailed(
                "drift_min_samples cannot exceed drift_window".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.drift_threshold) || self.drift_threshold == 0.0 {
            return Err(ConfigError::ValidationFailed(
                "drift_threshold must be in (0.0, 1.0]".to_string(),
            ));
        }

        if self.consistency_points == 0 {
            return Err(ConfigError::ValidationFailed(
                "consistency_points must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn replenish_config(&self) -> ReplenishConfig {
        ReplenishConfig {
            default_target: self.replenish_target,
            enabled_by_default: self.replenish_enabled,
            max_batch_size: self.max_batch_size,
            max_outstanding_batches: self.max_outstanding_batches,
            default_checkpoint: self.default_checkpoint.clone(),
            default_sampler: self.default_sampler.clone(),
            default_steps: self.default_steps,
        }
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            batch_limit: self.dispatch_batch_limit,
            scoring_limit: self.scoring_limit,
            score_max_attempts: self.score_max_attempts,
            handle_grace: self.handle_grace,
            image_root: self.image_root.clone(),
        }
    }

    pub fn drift_config(&self) -> DriftConfig {
        DriftConfig {
            window: self.drift_window,
            threshold: self.drift_threshold,
            min_recent_samples: self.drift_min_samples,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            consistency_points: self.consistency_points,
        }
    }

    /// Builder method to set the database path.
    pub fn with_database_path(mut self, path: impl Into<String>) -> Self {
        self.database_path = path.into();
        self
    }

    /// Builder method to set the output directory.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Builder method to set the generation backend URL.
    pub fn with_backend_url(mut self, url: impl Into<String>) -> Self {
        self.backend_url = url.into();
        self
    }

    /// Builder method to set the media server URL.
    pub fn with_media_url(mut self, url: impl Into<String>) -> Self {
        self.media_url = Some(url.into());
        self
    }

    /// Builder method to enable or disable scoring.
    pub fn with_scoring(mut self, enabled: bool) -> Self {
        self.scoring_enabled = enabled;
        self
    }

    /// Builder method to set the global replenishment target.
    pub fn with_replenish_target(mut self, target: u32) -> Self {
        self.replenish_target = target;
        self
    }

    /// Builder method to set the maximum batch size.
    pub fn with_max_batch_size(mut self, size: u32) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Builder method to set the handle-lost grace period.
    pub fn with_handle_grace(mut self, grace: Duration) -> Self {
        self.handle_grace = grace;
        self
    }

    /// Builder method to set drift detection parameters.
    pub fn with_drift(mut self, window: usize, threshold: f64, min_samples: usize) -> Self {
        self.drift_window = window;
        self.drift_threshold = threshold;
        self.drift_min_samples = min_samples;
        self
    }

    /// Builder method to set the consistency check length.
    pub fn with_consistency_points(mut self, points: usize) -> Self {
        self.consistency_points = points;
        self
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_vars(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.database_path, "reelforge.db");
        assert_eq!(config.replenish_target, 40);
        assert_eq!(config.max_batch_size, 5);
        assert_eq!(config.max_outstanding_batches, 1);
        assert_eq!(config.handle_grace, Duration::from_secs(120));
        assert_eq!(config.score_max_attempts, 3);
        assert_eq!(config.consistency_points, 3);
        assert!(config.replenish_enabled);
        assert!(config.media_url.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = from_vars(&[
            ("REELFORGE_DATABASE", "/data/rf.db"),
            ("REELFORGE_REPLENISH_TARGET", "25"),
            ("REELFORGE_REPLENISH_ENABLED", "off"),
            ("REELFORGE_DISPATCH_INTERVAL_SECS", "2"),
            ("REELFORGE_DRIFT_THRESHOLD", "0.2"),
            ("REELFORGE_MEDIA_URL", "http://media:9000"),
            ("REELFORGE_LLM_API_KEY", ""),
        ])
        .unwrap();

        assert_eq!(config.database_path, "/data/rf.db");
        assert_eq!(config.replenish_target, 25);
        assert!(!config.replenish_enabled);
        assert_eq!(config.dispatch_interval, Duration::from_secs(2));
        assert!((config.drift_threshold - 0.2).abs() < f64::EPSILON);
        assert_eq!(config.media_url.as_deref(), Some("http://media:9000"));
        assert_eq!(config.llm_api_key, None);

        assert_eq!(config.replenish_config().default_target, 25);
        assert!(!config.replenish_config().enabled_by_default);
        assert!((config.drift_config().threshold - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn test_from_lookup_rejects_bad_values() {
        let err = from_vars(&[("REELFORGE_MAX_BATCH_SIZE", "lots")]).unwrap_err();
        assert!(err.to_string().contains("REELFORGE_MAX_BATCH_SIZE"));

        let err = from_vars(&[("REELFORGE_SCORING_ENABLED", "maybe")]).unwrap_err();
        assert!(err.to_string().contains("expected boolean"));

        let err = from_vars(&[("REELFORGE_MAX_BATCH_SIZE", "0")]).unwrap_err();
        assert!(err.to_string().contains("max_batch_size"));
    }

    #[test]
    fn test_validation_invalid_values() {
        let config = AppConfig::default().with_database_path("");
        assert!(config.validate().unwrap_err().to_string().contains("database_path"));

        let config = AppConfig::default().with_drift(10, 0.15, 20);
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("drift_min_samples"));

        let config = AppConfig::default().with_drift(10, 1.5, 5);
        assert!(config.validate().unwrap_err().to_string().contains("drift_threshold"));

        let config = AppConfig::default().with_consistency_points(0);
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("consistency_points"));
    }

    #[test]
    fn test_derived_configs() {
        let config = AppConfig::default()
            .with_output_dir("/srv/out")
            .with_handle_grace(Duration::ZERO)
            .with_consistency_points(5);
        assert_eq!(config.dispatch_config().handle_grace, Duration::ZERO);
        assert_eq!(config.dispatch_config().image_root, PathBuf::from("output/images"));
        assert_eq!(config.orchestrator_config().consistency_points, 5);
        assert_eq!(config.output_dir, PathBuf::from("/srv/out"));
    }

    #[test]
    fn test_parse_env_bool() {
        assert!(parse_env_bool("true", "test").unwrap());
        assert!(parse_env_bool("1", "test").unwrap());
        assert!(parse_env_bool("YES", "test").unwrap());
        assert!(!parse_env_bool("off", "test").unwrap());
        assert!(!parse_env_bool("0", "test").unwrap());
        assert!(parse_env_bool("invalid", "test").is_err());
    }
}
