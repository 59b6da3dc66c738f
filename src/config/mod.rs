//! Configuration management for prompt-improver
//!
//! Supports configuration via:
//! 1. Config file (~/.config/prompt-improver/config.toml)
//! 2. Environment variables (OPENROUTER_BASE_URL, OPENROUTER_MODEL, etc.)
//!
//! User settings (API key, model, system prompt) live in the settings store;
//! this file only tunes the coordinator.

use crate::api::{ProviderConfig, DEFAULT_ENDPOINT, DEFAULT_MAX_INPUT_CHARS, DEFAULT_SYSTEM_PROMPT};
use crate::cache::CacheConfig;
use crate::queue::QueueConfig;
use crate::settings::DEFAULT_MODEL;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Provider endpoint and retry policy
    pub provider: ProviderSettings,

    /// Response cache settings
    pub cache: CacheSettings,

    /// Request queue settings
    pub queue: QueueSettings,

    /// Where settings and telemetry are stored
    pub storage: StorageSettings,
}

/// Provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// Chat completions endpoint
    pub base_url: String,

    /// Model used when the user has not chosen one
    pub default_model: String,

    /// System prompt used when the user has not written one
    pub default_system_prompt: String,

    /// Per-attempt timeout in seconds
    pub timeout_secs: u64,

    /// Retries after the first attempt on transient failures
    pub max_retries: u32,

    /// Fixed delay before a retry, in milliseconds
    pub retry_backoff_ms: u64,

    /// Longest accepted selection, in characters
    pub max_input_chars: usize,

    /// Attribution URL sent to the provider
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_url: Option<String>,

    /// Attribution title sent to the provider
    pub app_title: String,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_ENDPOINT.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            default_system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            timeout_secs: 15,
            max_retries: 1,
            retry_backoff_ms: 600,
            max_input_chars: DEFAULT_MAX_INPUT_CHARS,
            app_url: None,
            app_title: "Prompt Improver".to_string(),
        }
    }
}

/// Cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Whether results are cached at all
    pub enabled: bool,

    /// Entry lifetime in seconds
    pub ttl_secs: u64,

    /// Maximum entries held
    pub max_entries: usize,

    /// Period of the expiry sweep in seconds
    pub sweep_interval_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 3600,
            max_entries: 100,
            sweep_interval_secs: 300,
        }
    }
}

/// Queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Requests allowed in flight at once
    pub max_concurrent: usize,

    /// Position events buffered per subscriber
    pub event_capacity: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            event_capacity: 64,
        }
    }
}

/// Storage settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Data directory (default: platform data dir)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

impl Config {
    /// Get default config file path
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("prompt-improver")
            .join("config.toml")
    }

    /// Load config from default location
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Self::default_path())
    }

    /// Load config from specific path
    pub fn load_from(path: PathBuf) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default().with_env_overrides());
        }

        let content = std::fs::read_to_string(&path)?;
        let config: Config = toml::from_str(&content)?;

        Ok(config.with_env_overrides())
    }

    /// Apply environment variable overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var("OPENROUTER_BASE_URL") {
            self.provider.base_url = url;
        }
        if let Ok(model) = std::env::var("OPENROUTER_MODEL") {
            self.provider.default_model = model;
        }
        if let Ok(dir) = std::env::var("PROMPT_IMPROVER_DATA_DIR") {
            self.storage.data_dir = Some(PathBuf::from(dir));
        }

        self
    }

    /// Save config to default location
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(Self::default_path())
    }

    /// Save config to specific path
    pub fn save_to(&self, path: PathBuf) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.provider.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("provider.base_url is empty".to_string()));
        }
        if self.provider.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "provider.timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.provider.max_input_chars == 0 {
            return Err(ConfigError::Invalid(
                "provider.max_input_chars must be at least 1".to_string(),
            ));
        }
        if self.cache.max_entries == 0 {
            return Err(ConfigError::Invalid(
                "cache.max_entries must be at least 1".to_string(),
            ));
        }
        if self.cache.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "cache.sweep_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.queue.max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "queue.max_concurrent must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Directory holding the settings/telemetry store
    pub fn data_dir(&self) -> PathBuf {
        self.storage.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("prompt-improver")
        })
    }

    /// Provider client configuration
    pub fn provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            endpoint: self.provider.base_url.clone(),
            timeout: Duration::from_secs(self.provider.timeout_secs),
            max_retries: self.provider.max_retries,
            retry_backoff: Duration::from_millis(self.provider.retry_backoff_ms),
            max_input_chars: self.provider.max_input_chars,
            default_system_prompt: self.provider.default_system_prompt.clone(),
            app_url: self.provider.app_url.clone(),
            app_title: Some(self.provider.app_title.clone()).filter(|t| !t.is_empty()),
        }
    }

    /// Response cache configuration
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            ttl: Duration::from_secs(self.cache.ttl_secs),
            max_entries: self.cache.max_entries,
            sweep_interval: Duration::from_secs(self.cache.sweep_interval_secs),
        }
    }

    /// Request queue configuration
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_concurrent: self.queue.max_concurrent,
            event_capacity: self.queue.event_capacity,
        }
    }

    /// Generate example config content
    pub fn example() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

/// Builder for creating Config programmatically
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.provider.base_url = url.into();
        self
    }

    pub fn default_model(mut self, model: impl Into<String>) -> Self {
        self.config.provider.default_model = model.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.provider.timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.provider.max_retries = retries;
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.config.provider.retry_backoff_ms = backoff.as_millis() as u64;
        self
    }

    pub fn cache_enabled(mut self, enabled: bool) -> Self {
        self.config.cache.enabled = enabled;
        self
    }

    pub fn cache_capacity(mut self, max_entries: usize) -> Self {
        self.config.cache.max_entries = max_entries;
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.cache.ttl_secs = ttl.as_secs();
        self
    }

    pub fn max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.config.queue.max_concurrent = max_concurrent;
        self
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.storage.data_dir = Some(dir.into());
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.provider.default_model, "openrouter/auto");
        assert_eq!(config.provider.timeout_secs, 15);
        assert_eq!(config.provider.max_retries, 1);
        assert_eq!(config.cache.max_entries, 100);
        assert_eq!(config.queue.max_concurrent, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = ConfigBuilder::new()
            .base_url("http://localhost:9999/v1/chat/completions")
            .cache_capacity(10)
            .max_concurrent(2)
            .build();

        assert_eq!(config.cache_config().max_entries, 10);
        assert_eq!(config.queue_config().max_concurrent, 2);
        assert_eq!(
            config.provider_config().endpoint,
            "http://localhost:9999/v1/chat/completions"
        );
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let config = ConfigBuilder::new().max_concurrent(0).build();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = ConfigBuilder::new().cache_capacity(0).build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str("[cache]\nttl_secs = 60\n").unwrap();
        assert_eq!(config.cache.ttl_secs, 60);
        assert_eq!(config.cache.max_entries, 100);
        assert_eq!(config.provider.retry_backoff_ms, 600);
    }

    #[test]
    fn test_example_config() {
        let example = Config::example();
        assert!(example.contains("[provider]"));
        assert!(example.contains("[cache]"));
        assert!(example.contains("[queue]"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let config = ConfigBuilder::new().cache_ttl(Duration::from_secs(120)).build();
        config.save_to(path.clone()).unwrap();

        let loaded = Config::load_from(path).unwrap();
        assert_eq!(loaded.cache.ttl_secs, 120);
    }
}
