//! Bazaar Config - Configuration management for the marketplace client
//!
//! Provides hierarchical configuration loading from multiple sources:
//! - Default values
//! - Configuration files (TOML)
//! - Environment variables (`BAZAAR_*`, optionally from a `.env` file)
//! - Runtime overrides via [`ConfigBuilder`]

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load config file: {0}")]
    LoadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Missing required config: {0}")]
    MissingRequired(String),

    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}

/// Remote backend-as-a-service endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Project base URL, e.g. `https://xyz.example.co`
    pub url: String,
    /// Public (anon) API key sent with every request
    pub anon_key: String,
    pub request_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            anon_key: String::new(),
            request_timeout_ms: 15_000,
        }
    }
}

/// Deployment progress polling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub poll_interval_ms: u64,
    /// Highest percent shown while the remote job is still deploying
    pub max_pending_percent: u8,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            max_pending_percent: 95,
        }
    }
}

/// A/B traffic allocation bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    pub min_versions: usize,
    pub max_versions: usize,
    pub min_allocation: u32,
    pub max_allocation: u32,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            min_versions: 2,
            max_versions: 5,
            min_allocation: 10,
            max_allocation: 90,
        }
    }
}

/// Realtime change feed connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub heartbeat_interval_ms: u64,
    pub initial_reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    /// Maximum reconnection attempts (0 = infinite)
    pub max_reconnect_attempts: u32,
    pub connect_timeout_ms: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            initial_reconnect_delay_ms: 1000,
            max_reconnect_delay_ms: 30_000,
            max_reconnect_attempts: 0,
            connect_timeout_ms: 10_000,
        }
    }
}

/// Monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
    pub json_logs: bool,
    pub log_buffer_capacity: usize,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            log_buffer_capacity: 500,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BazaarConfig {
    pub environment: String,
    pub backend: BackendConfig,
    pub tracker: TrackerConfig,
    pub allocator: AllocatorConfig,
    pub realtime: RealtimeConfig,
    pub monitoring: MonitoringConfig,
}

impl Default for BazaarConfig {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            backend: BackendConfig::default(),
            tracker: TrackerConfig::default(),
            allocator: AllocatorConfig::default(),
            realtime: RealtimeConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl BazaarConfig {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::LoadError(e.to_string()))?;

        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let _ = dotenv::dotenv();

        let mut config = Self::from_file(path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;

        Ok(config)
    }

    /// Apply `BAZAAR_*` overrides read through `lookup`
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(env) = lookup("BAZAAR_ENVIRONMENT") {
            self.environment = env;
        }

        if let Some(url) = lookup("BAZAAR_BACKEND_URL") {
            self.backend.url = url;
        }

        if let Some(key) = lookup("BAZAAR_ANON_KEY") {
            self.backend.anon_key = key;
        }

        if let Some(val) = lookup("BAZAAR_POLL_INTERVAL_MS") {
            self.tracker.poll_interval_ms = val
                .parse()
                .map_err(|_| ConfigError::InvalidValue("BAZAAR_POLL_INTERVAL_MS".to_string()))?;
        }

        if let Some(level) = lookup("BAZAAR_LOG_LEVEL") {
            self.monitoring.log_level = level;
        }

        if let Some(val) = lookup("BAZAAR_JSON_LOGS") {
            self.monitoring.json_logs = val
                .parse()
                .map_err(|_| ConfigError::InvalidValue("BAZAAR_JSON_LOGS".to_string()))?;
        }

        Ok(())
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend.url.is_empty() {
            return Err(ConfigError::MissingRequired("backend.url".to_string()));
        }

        let parsed = url::Url::parse(&self.backend.url)
            .map_err(|e| ConfigError::InvalidValue(format!("backend.url: {}", e)))?;
        if parsed.scheme() != "https" && parsed.scheme() != "http" {
            return Err(ConfigError::InvalidValue(
                "backend.url must use http or https".to_string(),
            ));
        }

        if self.backend.anon_key.is_empty() {
            return Err(ConfigError::MissingRequired("backend.anon_key".to_string()));
        }

        if self.tracker.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue("tracker.poll_interval_ms must be positive".to_string()));
        }

        if self.tracker.max_pending_percent >= 100 {
            return Err(ConfigError::InvalidValue(
                "tracker.max_pending_percent must stay below 100".to_string(),
            ));
        }

        let alloc = &self.allocator;
        if alloc.min_versions < 2 || alloc.min_versions > alloc.max_versions {
            return Err(ConfigError::InvalidValue(
                "allocator version bounds are inconsistent".to_string(),
            ));
        }

        if alloc.min_allocation >= alloc.max_allocation || alloc.max_allocation > 100 {
            return Err(ConfigError::InvalidValue(
                "allocator percentage bounds are inconsistent".to_string(),
            ));
        }

        let realtime = &self.realtime;
        for (name, value) in [
            ("realtime.heartbeat_interval_ms", realtime.heartbeat_interval_ms),
            ("realtime.initial_reconnect_delay_ms", realtime.initial_reconnect_delay_ms),
            ("realtime.connect_timeout_ms", realtime.connect_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue(format!("{} must be positive", name)));
            }
        }

        if realtime.max_reconnect_delay_ms < realtime.initial_reconnect_delay_ms {
            return Err(ConfigError::InvalidValue(
                "realtime.max_reconnect_delay_ms must not be below the initial delay".to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder for BazaarConfig
pub struct ConfigBuilder {
    config: BazaarConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: BazaarConfig::default(),
        }
    }

    pub fn environment(mut self, env: &str) -> Self {
        self.config.environment = env.to_string();
        self
    }

    pub fn backend(mut self, url: &str, anon_key: &str) -> Self {
        self.config.backend.url = url.to_string();
        self.config.backend.anon_key = anon_key.to_string();
        self
    }

    pub fn tracker(mut self, tracker: TrackerConfig) -> Self {
        self.config.tracker = tracker;
        self
    }

    pub fn allocator(mut self, allocator: AllocatorConfig) -> Self {
        self.config.allocator = allocator;
        self
    }

    pub fn realtime(mut self, realtime: RealtimeConfig) -> Self {
        self.config.realtime = realtime;
        self
    }

    pub fn monitoring(mut self, monitoring: MonitoringConfig) -> Self {
        self.config.monitoring = monitoring;
        self
    }

    pub fn build(self) -> BazaarConfig {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `monitoring.log_level` when set. Calling this twice
/// is harmless; the second install is ignored.
pub fn init_tracing(monitoring: &MonitoringConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&monitoring.log_level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if monitoring.json_logs {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn valid() -> BazaarConfig {
        ConfigBuilder::new()
            .backend("https://project.example.co", "anon-key")
            .build()
    }

    #[test]
    fn test_default_config() {
        let config = BazaarConfig::default();
        assert_eq!(config.environment, "development");
        assert!(!config.is_production());
        assert_eq!(config.tracker.poll_interval_ms, 2000);
        assert_eq!(config.allocator.max_versions, 5);
    }

    #[test]
    fn test_config_builder() {
        let config = ConfigBuilder::new().environment("staging").build();
        assert_eq!(config.environment, "staging");
    }

    #[test]
    fn test_validate_requires_backend() {
        let config = BazaarConfig::default();
        assert!(matches!(config.validate(), Err(ConfigError::MissingRequired(_))));
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_url() {
        let config = ConfigBuilder::new().backend("ftp://files", "k").build();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_validate_rejects_zero_realtime_timings() {
        let mut config = valid();
        config.realtime.heartbeat_interval_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_))));

        let mut config = valid();
        config.realtime.connect_timeout_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_))));

        let mut config = valid();
        config.realtime.initial_reconnect_delay_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_pending_cap() {
        let config = BazaarConfig::from_toml_str(
            r#"
            [backend]
            url = "https://project.example.co"
            anon_key = "abc"

            [tracker]
            max_pending_percent = 200
            "#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_from_file_with_env_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[backend]").unwrap();
        writeln!(file, "url = \"https://project.example.co\"").unwrap();
        writeln!(file, "anon_key = \"abc\"").unwrap();
        writeln!(file, "[realtime]").unwrap();
        writeln!(file, "heartbeat_interval_ms = 0").unwrap();

        assert!(BazaarConfig::from_file(file.path()).is_ok());
        assert!(matches!(
            BazaarConfig::from_file_with_env(file.path()),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = BazaarConfig::from_toml_str(
            r#"
            environment = "production"

            [backend]
            url = "https://project.example.co"
            anon_key = "abc"

            [tracker]
            poll_interval_ms = 500
            "#,
        )
        .unwrap();

        assert!(config.is_production());
        assert_eq!(config.tracker.poll_interval_ms, 500);
        assert_eq!(config.tracker.max_pending_percent, 95);
        assert_eq!(config.realtime.heartbeat_interval_ms, 30_000);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "environment = \"staging\"").unwrap();

        let config = BazaarConfig::from_file(file.path()).unwrap();
        assert_eq!(config.environment, "staging");

        assert!(matches!(
            BazaarConfig::from_file("/nonexistent/bazaar.toml"),
            Err(ConfigError::LoadError(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("BAZAAR_BACKEND_URL", "https://other.example.co"),
            ("BAZAAR_POLL_INTERVAL_MS", "750"),
        ]
        .into_iter()
        .collect();

        let mut config = valid();
        config
            .apply_env_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.backend.url, "https://other.example.co");
        assert_eq!(config.tracker.poll_interval_ms, 750);

        let result = config.apply_env_overrides(|k| {
            (k == "BAZAAR_POLL_INTERVAL_MS").then(|| "soon".to_string())
        });
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }
}
