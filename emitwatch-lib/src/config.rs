//! Configuration management with hierarchical overrides using figment.
//!
//! Supports multiple configuration sources with precedence:
//! 1. Command-line flags (highest precedence, applied by the binary)
//! 2. Environment variables (`EMITWATCH_*`, `__` separates sections)
//! 3. User configuration file (~/.config/emitwatch/config.toml)
//! 4. System configuration file (/etc/emitwatch/config.toml)
//! 5. Embedded defaults (lowest precedence)
//!
//! Every interval the pipeline uses is configurable so tests can run the same
//! code paths with compressed timeframes.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration format: {0}")]
    InvalidFormat(#[from] Box<figment::Error>),

    #[error("Configuration validation failed: {message}")]
    ValidationError { message: String },
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::InvalidFormat(Box::new(err))
    }
}

/// Main configuration structure for emitwatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Push connection settings
    pub connection: ConnectionConfig,
    /// Buffering, flush cadence and retention
    pub ingest: IngestConfig,
    /// Rolling metrics series shape
    pub metrics: MetricsConfig,
    /// Presentation filter thresholds
    pub filter: FilterConfig,
    /// Durable log store location
    pub store: StoreConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Push connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// WebSocket endpoint delivering emit records
    pub endpoint: String,
    /// Period of the staleness check in milliseconds
    pub heartbeat_check_ms: u64,
    /// Silence after which an open connection is considered stale
    pub stale_after_ms: u64,
    /// First reconnect delay in milliseconds
    pub backoff_base_ms: u64,
    /// Upper bound on the exponential part of the reconnect delay
    pub backoff_max_ms: u64,
    /// Random jitter added to each reconnect delay, drawn from `[0, jitter)`
    pub backoff_jitter_ms: u64,
}

/// Ingestion buffer and visible log configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IngestConfig {
    /// Flush tick period in milliseconds
    pub flush_interval_ms: u64,
    /// How long a freshly flushed row keeps its flash marker
    pub flash_ms: u64,
    /// How long the latest batch summary stays up before retraction
    pub banner_ms: u64,
    /// Retention window for the visible log and the durable store
    pub retention_minutes: u64,
    /// Maximum number of visible log entries
    pub max_visible: usize,
}

/// Metrics series configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Number of buckets in the rolling series
    pub series_length: usize,
    /// Width of one bucket in milliseconds
    pub bucket_ms: u64,
}

/// Presentation filter configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FilterConfig {
    /// Visible `SPEEDING` rows per filter pass
    pub speeding_cap: usize,
    /// Visible rows per (category, track id, text) triple
    pub track_text_cap: usize,
    /// `WRONG_DIRECTION` rows need a confidence strictly above this percentage
    pub wrong_direction_min_confidence_pct: f64,
}

/// Durable log store configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the segment files
    pub path: PathBuf,
    /// Segment size that triggers rotation
    pub segment_max_bytes: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, human)
    pub format: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:8000/ws/logs".to_owned(),
            heartbeat_check_ms: 5_000,
            stale_after_ms: 15_000,
            backoff_base_ms: 1_000,
            backoff_max_ms: 15_000,
            backoff_jitter_ms: 400,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 3_000,
            flash_ms: 3_200,
            banner_ms: 2_600,
            retention_minutes: 10,
            max_visible: 500,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            series_length: 26,
            bucket_ms: 3_000,
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            speeding_cap: 2,
            track_text_cap: 2,
            wrong_direction_min_confidence_pct: 25.0,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_data_dir().join("log"),
            segment_max_bytes: 8 * 1024 * 1024,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "human".to_owned(),
        }
    }
}

impl ConnectionConfig {
    pub const fn heartbeat_check(&self) -> Duration {
        Duration::from_millis(self.heartbeat_check_ms)
    }

    pub const fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }
}

impl IngestConfig {
    pub const fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub const fn flash(&self) -> Duration {
        Duration::from_millis(self.flash_ms)
    }

    pub const fn banner(&self) -> Duration {
        Duration::from_millis(self.banner_ms)
    }

    /// Retention window in milliseconds.
    pub const fn retention_ms(&self) -> i64 {
        #[allow(clippy::as_conversions)] // Bounded by validation to well under i64::MAX
        let minutes = self.retention_minutes as i64;
        minutes.saturating_mul(60_000)
    }
}

/// Platform data directory for the default store location.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("emitwatch")
}

/// Configuration loader with hierarchical override support.
pub struct ConfigLoader {
    component: String,
    explicit_file: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader for the specified component.
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_owned(),
            explicit_file: None,
        }
    }

    /// Layer an explicit configuration file above the system and user files.
    ///
    /// Unlike the implicit files, this one must exist.
    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.explicit_file = Some(path.into());
        self
    }

    /// Load configuration with hierarchical overrides using figment.
    pub fn load(&self) -> Result<Config, ConfigError> {
        let mut figment = Figment::new()
            // Start with embedded defaults
            .merge(Serialized::defaults(Config::default()));

        // System configuration file (optional)
        let system_config_path = Path::new("/etc/emitwatch/config.toml");
        if system_config_path.exists() {
            figment = figment.merge(Toml::file(system_config_path));
        }

        // User configuration file (optional)
        let user_config_path = Self::user_config_path();
        if user_config_path.exists() {
            figment = figment.merge(Toml::file(&user_config_path));
        }

        if let Some(ref path) = self.explicit_file {
            if !path.exists() {
                return Err(ConfigError::FileNotFound { path: path.clone() });
            }
            figment = figment.merge(Toml::file(path));
        }

        // Environment variables with component prefix
        figment = figment.merge(
            Env::prefixed(&format!(
                "{}_",
                self.component.replace('-', "_").to_uppercase()
            ))
            .split("__"),
        );

        let config: Config = figment.extract()?;
        Self::validate_config(&config)?;
        Ok(config)
    }

    /// Get the user configuration file path using platform-aware directory lookup.
    fn user_config_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            return config_dir.join("emitwatch").join("config.toml");
        }

        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".config")
                .join("emitwatch")
                .join("config.toml");
        }

        PathBuf::from("/tmp")
            .join(".config")
            .join("emitwatch")
            .join("config.toml")
    }

    /// Validate the final configuration.
    pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
        fn invalid(message: &str) -> Result<(), ConfigError> {
            Err(ConfigError::ValidationError {
                message: message.to_owned(),
            })
        }

        let connection = &config.connection;
        if connection.endpoint.trim().is_empty() {
            return invalid("connection.endpoint must not be empty");
        }
        if connection.heartbeat_check_ms == 0 || connection.stale_after_ms == 0 {
            return invalid("heartbeat_check_ms and stale_after_ms must be greater than 0");
        }
        if connection.backoff_base_ms == 0 {
            return invalid("backoff_base_ms must be greater than 0");
        }
        if connection.backoff_base_ms > connection.backoff_max_ms {
            return invalid("backoff_base_ms must not exceed backoff_max_ms");
        }

        let ingest = &config.ingest;
        if ingest.flush_interval_ms == 0 {
            return invalid("flush_interval_ms must be greater than 0");
        }
        if ingest.retention_minutes == 0 || ingest.retention_minutes > 60 * 24 * 365 {
            return invalid("retention_minutes must be between 1 and 525600");
        }
        if ingest.max_visible == 0 {
            return invalid("max_visible must be greater than 0");
        }

        if config.metrics.series_length == 0 || config.metrics.bucket_ms == 0 {
            return invalid("series_length and bucket_ms must be greater than 0");
        }

        if config.filter.speeding_cap == 0 || config.filter.track_text_cap == 0 {
            return invalid("filter caps must be greater than 0");
        }
        if !config.filter.wrong_direction_min_confidence_pct.is_finite() {
            return invalid("wrong_direction_min_confidence_pct must be a finite number");
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_loader_defaults() {
        let loader = ConfigLoader::new("emitwatch-test-defaults");
        let config = loader.load().expect("Failed to load config in test");

        assert_eq!(config.ingest.flush_interval_ms, 3_000);
        assert_eq!(config.ingest.flash_ms, 3_200);
        assert_eq!(config.ingest.banner_ms, 2_600);
        assert_eq!(config.ingest.retention_minutes, 10);
        assert_eq!(config.ingest.max_visible, 500);
        assert_eq!(config.connection.heartbeat_check_ms, 5_000);
        assert_eq!(config.connection.stale_after_ms, 15_000);
        assert_eq!(config.connection.backoff_base_ms, 1_000);
        assert_eq!(config.connection.backoff_max_ms, 15_000);
        assert_eq!(config.metrics.series_length, 26);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_explicit_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            r#"
[connection]
endpoint = "ws://feed.local/ws/logs"

[ingest]
flush_interval_ms = 250
max_visible = 50
"#
        )
        .expect("write config");

        let config = ConfigLoader::new("emitwatch-test-file")
            .with_file(file.path())
            .load()
            .expect("Failed to load config with file");

        assert_eq!(config.connection.endpoint, "ws://feed.local/ws/logs");
        assert_eq!(config.ingest.flush_interval_ms, 250);
        assert_eq!(config.ingest.max_visible, 50);
        // Untouched keys keep their defaults
        assert_eq!(config.ingest.flash_ms, 3_200);
        assert_eq!(config.connection.backoff_max_ms, 15_000);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let result = ConfigLoader::new("emitwatch-test-missing")
            .with_file("/nonexistent/emitwatch.toml")
            .load();
        assert!(matches!(result, Err(ConfigError::FileNotFound { .. })));
    }

    #[test]
    fn test_config_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.ingest.flush_interval_ms = 0;
        assert!(ConfigLoader::validate_config(&config).is_err());

        let mut config = Config::default();
        config.connection.backoff_base_ms = 20_000;
        assert!(ConfigLoader::validate_config(&config).is_err());

        let mut config = Config::default();
        config.connection.endpoint = "  ".to_owned();
        assert!(ConfigLoader::validate_config(&config).is_err());

        let mut config = Config::default();
        config.metrics.series_length = 0;
        assert!(ConfigLoader::validate_config(&config).is_err());
    }

    #[test]
    fn test_config_validation_valid() {
        assert!(ConfigLoader::validate_config(&Config::default()).is_ok());
    }

    #[test]
    fn test_duration_helpers() {
        let config = Config::default();
        assert_eq!(config.ingest.flush_interval(), Duration::from_secs(3));
        assert_eq!(config.ingest.retention_ms(), 600_000);
        assert_eq!(config.connection.stale_after(), Duration::from_secs(15));
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let config = Config::default();
        let toml = toml::to_string(&config).expect("Failed to serialize config to TOML in test");
        let deserialized: Config =
            toml::from_str(&toml).expect("Failed to deserialize config from TOML in test");
        assert_eq!(config, deserialized);
    }
}
