//! Pipeline configuration.
//!
//! Settings for consumers and admins of one resource, plus an environment
//! loader for deployments that configure everything through variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub use crate::lock::LockSettings;

/// Default Redis endpoint.
pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

/// Default pause after a poll that made no progress.
pub const DEFAULT_PULL_INTERVAL: Duration = Duration::from_millis(500);

/// Settings for a [`super::PipelineConsumer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerSettings {
    /// Resource name all keys and the lock derive from.
    pub resource: String,
    /// Consecutive failures after which the pipeline stops.
    /// `u32::MAX` effectively never stops.
    pub max_retries: u32,
    /// Pause after a poll that made no progress.
    pub pull_interval: Duration,
    /// Lock timing for each poll.
    pub lock: LockSettings,
}

impl ConsumerSettings {
    /// Creates settings for `resource` with default retry and timing values.
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            max_retries: u32::MAX,
            pull_interval: DEFAULT_PULL_INTERVAL,
            lock: LockSettings::default(),
        }
    }

    /// Sets the retry limit.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the idle pull interval.
    pub fn with_pull_interval(mut self, interval: Duration) -> Self {
        self.pull_interval = interval;
        self
    }

    /// Sets the lock timing.
    pub fn with_lock(mut self, lock: LockSettings) -> Self {
        self.lock = lock;
        self
    }

    /// Validates the settings.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` for an empty resource, a zero
    /// retry limit, or invalid lock timing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_resource(&self.resource)?;

        if self.max_retries == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_retries must be greater than 0".to_string(),
            ));
        }

        validate_lock(&self.lock)
    }
}

/// Settings for a [`super::PipelineAdmin`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminSettings {
    /// Resource name all keys and the lock derive from.
    pub resource: String,
    /// Lock timing for clean and resume.
    pub lock: LockSettings,
}

impl AdminSettings {
    /// Creates settings for `resource` with default lock timing.
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            lock: LockSettings::default(),
        }
    }

    /// Sets the lock timing.
    pub fn with_lock(mut self, lock: LockSettings) -> Self {
        self.lock = lock;
        self
    }

    /// Validates the settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_resource(&self.resource)?;
        validate_lock(&self.lock)
    }
}

/// Complete configuration for one pipeline deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Redis nodes. The first one holds pipeline data; all of them vote on locks.
    pub redis_urls: Vec<String>,
    /// Resource name.
    pub resource: String,
    /// Consecutive failures after which the pipeline stops.
    pub max_retries: u32,
    /// Pause after a poll that made no progress.
    pub pull_interval: Duration,
    /// Lock timing shared by consumer and admin.
    pub lock: LockSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            redis_urls: vec![DEFAULT_REDIS_URL.to_string()],
            resource: String::new(),
            max_retries: u32::MAX,
            pull_interval: DEFAULT_PULL_INTERVAL,
            lock: LockSettings::default(),
        }
    }
}

impl PipelineConfig {
    /// Creates a configuration for `resource` with default values.
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            ..Self::default()
        }
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `REDIS_PIPELINE_RESOURCE`: Resource name (required)
    /// - `REDIS_PIPELINE_URLS`: Comma-separated Redis URLs (default: redis://localhost:6379)
    /// - `REDIS_PIPELINE_MAX_RETRIES`: Retry limit (default: unbounded)
    /// - `REDIS_PIPELINE_PULL_INTERVAL_MS`: Idle pull interval (default: 500)
    /// - `REDIS_PIPELINE_LOCK_EXPIRY_MS`: Lock expiry (default: 10000)
    /// - `REDIS_PIPELINE_LOCK_WAIT_MS`: Lock wait window (default: 500)
    /// - `REDIS_PIPELINE_LOCK_RETRY_MS`: Lock retry interval (default: 100)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or have invalid values.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        config.resource = lookup("REDIS_PIPELINE_RESOURCE")
            .ok_or_else(|| ConfigError::MissingEnvVar("REDIS_PIPELINE_RESOURCE".to_string()))?;

        if let Some(val) = lookup("REDIS_PIPELINE_URLS") {
            config.redis_urls = val
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Some(val) = lookup("REDIS_PIPELINE_MAX_RETRIES") {
            config.max_retries = parse_env_value(&val, "REDIS_PIPELINE_MAX_RETRIES")?;
        }

        if let Some(val) = lookup("REDIS_PIPELINE_PULL_INTERVAL_MS") {
            config.pull_interval = parse_env_millis(&val, "REDIS_PIPELINE_PULL_INTERVAL_MS")?;
        }

        if let Some(val) = lookup("REDIS_PIPELINE_LOCK_EXPIRY_MS") {
            config.lock.expiry_time = parse_env_millis(&val, "REDIS_PIPELINE_LOCK_EXPIRY_MS")?;
        }

        if let Some(val) = lookup("REDIS_PIPELINE_LOCK_WAIT_MS") {
            config.lock.wait_time = parse_env_millis(&val, "REDIS_PIPELINE_LOCK_WAIT_MS")?;
        }

        if let Some(val) = lookup("REDIS_PIPELINE_LOCK_RETRY_MS") {
            config.lock.retry_time = parse_env_millis(&val, "REDIS_PIPELINE_LOCK_RETRY_MS")?;
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
        if self.redis_urls.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "at least one Redis URL is required".to_string(),
            ));
        }

        if self.redis_urls.iter().any(|url| url.trim().is_empty()) {
            return Err(ConfigError::ValidationFailed(
                "Redis URLs cannot be empty".to_string(),
            ));
        }

        self.consumer_settings().validate()
    }

    /// Settings for a consumer of this pipeline.
    pub fn consumer_settings(&self) -> ConsumerSettings {
        ConsumerSettings::new(&self.resource)
            .with_max_retries(self.max_retries)
            .with_pull_interval(self.pull_interval)
            .with_lock(self.lock)
    }

    /// Settings for an admin of this pipeline.
    pub fn admin_settings(&self) -> AdminSettings {
        AdminSettings::new(&self.resource).with_lock(self.lock)
    }

    /// Builder method to set Redis URLs.
    pub fn with_redis_urls(mut self, urls: Vec<String>) -> Self {
        self.redis_urls = urls;
        self
    }

    /// Builder method to set the retry limit.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Builder method to set the pull interval.
    pub fn with_pull_interval(mut self, interval: Duration) -> Self {
        self.pull_interval = interval;
        self
    }

    /// Builder method to set the lock timing.
    pub fn with_lock(mut self, lock: LockSettings) -> Self {
        self.lock = lock;
        self
    }
}

fn validate_resource(resource: &str) -> Result<(), ConfigError> {
    if resource.trim().is_empty() {
        return Err(ConfigError::ValidationFailed(
            "resource cannot be empty".to_string(),
        ));
    }
    Ok(())
}

fn validate_lock(lock: &LockSettings) -> Result<(), ConfigError> {
    lock.validate()
        .map_err(|e| ConfigError::ValidationFailed(e.to_string()))
}

/// Parse an environment variable value into the target type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable holding a millisecond duration.
fn parse_env_millis(value: &str, key: &str) -> Result<Duration, ConfigError> {
    parse_env_value::<u64>(value, key).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_consumer_settings_default() {
        let settings = ConsumerSettings::new("orders");
        assert_eq!(settings.resource, "orders");
        assert_eq!(settings.max_retries, u32::MAX);
        assert_eq!(settings.pull_interval, Duration::from_millis(500));
        assert_eq!(settings.lock, LockSettings::default());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_consumer_settings_validation() {
        assert!(ConsumerSettings::new("").validate().is_err());
        assert!(ConsumerSettings::new("orders")
            .with_max_retries(0)
            .validate()
            .is_err());
        assert!(ConsumerSettings::new("orders")
            .with_lock(LockSettings::default().with_expiry_time(Duration::ZERO))
            .validate()
            .is_err());
    }

    #[test]
    fn test_admin_settings() {
        let settings = AdminSettings::new("orders")
            .with_lock(LockSettings::default().with_wait_time(Duration::from_secs(2)));
        assert_eq!(settings.lock.wait_time, Duration::from_secs(2));
        assert!(settings.validate().is_ok());
        assert!(AdminSettings::new("  ").validate().is_err());
    }

    #[test]
    fn test_from_lookup_defaults() {
        let config = PipelineConfig::from_lookup(lookup_from(&[(
            "REDIS_PIPELINE_RESOURCE",
            "orders",
        )]))
        .unwrap();

        assert_eq!(config.resource, "orders");
        assert_eq!(config.redis_urls, vec![DEFAULT_REDIS_URL.to_string()]);
        assert_eq!(config.max_retries, u32::MAX);
        assert_eq!(config.pull_interval, DEFAULT_PULL_INTERVAL);
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = PipelineConfig::from_lookup(lookup_from(&[
            ("REDIS_PIPELINE_RESOURCE", "orders"),
            ("REDIS_PIPELINE_URLS", "redis://a:6379, redis://b:6379,redis://c:6379"),
            ("REDIS_PIPELINE_MAX_RETRIES", "5"),
            ("REDIS_PIPELINE_PULL_INTERVAL_MS", "250"),
            ("REDIS_PIPELINE_LOCK_EXPIRY_MS", "30000"),
            ("REDIS_PIPELINE_LOCK_WAIT_MS", "1000"),
            ("REDIS_PIPELINE_LOCK_RETRY_MS", "50"),
        ]))
        .unwrap();

        assert_eq!(config.redis_urls.len(), 3);
        assert_eq!(config.redis_urls[1], "redis://b:6379");
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.pull_interval, Duration::from_millis(250));
        assert_eq!(config.lock.expiry_time, Duration::from_secs(30));
        assert_eq!(config.lock.wait_time, Duration::from_secs(1));
        assert_eq!(config.lock.retry_time, Duration::from_millis(50));

        let consumer = config.consumer_settings();
        assert_eq!(consumer.max_retries, 5);
        assert_eq!(consumer.lock, config.lock);
        assert_eq!(config.admin_settings().resource, "orders");
    }

    #[test]
    fn test_from_lookup_requires_resource() {
        let err = PipelineConfig::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref key) if key == "REDIS_PIPELINE_RESOURCE"));
    }

    #[test]
    fn test_from_lookup_rejects_invalid_values() {
        let err = PipelineConfig::from_lookup(lookup_from(&[
            ("REDIS_PIPELINE_RESOURCE", "orders"),
            ("REDIS_PIPELINE_MAX_RETRIES", "many"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("REDIS_PIPELINE_MAX_RETRIES"));

        let err = PipelineConfig::from_lookup(lookup_from(&[
            ("REDIS_PIPELINE_RESOURCE", "orders"),
            ("REDIS_PIPELINE_MAX_RETRIES", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationFailed(_)));
    }

    #[test]
    fn test_validate_rejects_missing_urls() {
        let config = PipelineConfig::new("orders").with_redis_urls(Vec::new());
        assert!(config.validate().is_err());
    }
}
