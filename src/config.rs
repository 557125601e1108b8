//! Configuration management for slidegate.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, SlidegateError};
use crate::ratelimit::{CleanupScheduler, Policy, PolicySet, DEFAULT_QUEUE_CAPACITY};
use crate::store::{RedisStore, RedisStoreConfig, WindowStore};

/// Prefix for environment variable overrides, e.g. `SLIDEGATE__STORE__URL`.
const ENV_PREFIX: &str = "SLIDEGATE";

/// Main configuration for slidegate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlidegateConfig {
    /// Backing store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Cleanup worker configuration
    #[serde(default)]
    pub cleanup: CleanupConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Named rate limit policies
    #[serde(default)]
    pub policies: HashMap<String, Policy>,
}

/// Backing store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL
    #[serde(default = "default_url")]
    pub url: String,

    /// Prefix prepended to every stored key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Upper bound for one evaluation round-trip in milliseconds
    #[serde(default)]
    pub call_timeout_ms: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            key_prefix: default_key_prefix(),
            call_timeout_ms: None,
        }
    }
}

fn default_url() -> String {
    "redis://127.0.0.1/".to_string()
}

fn default_key_prefix() -> String {
    RedisStoreConfig::default().key_prefix
}

impl StoreConfig {
    /// The evaluation timeout, if configured.
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    /// Connect to the configured Redis.
    pub async fn connect(&self) -> Result<RedisStore> {
        let config = RedisStoreConfig {
            key_prefix: self.key_prefix.clone(),
        };
        RedisStore::connect_with_config(&self.url, config).await
    }
}

/// Cleanup worker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Whether admitted keys are reclaimed in the background
    #[serde(default = "default_cleanup_enabled")]
    pub enabled: bool,

    /// Jobs the queue holds before new ones are dropped
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: default_cleanup_enabled(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_cleanup_enabled() -> bool {
    true
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

impl CleanupConfig {
    /// Start a cleanup worker for `store`, or `None` when disabled.
    pub fn spawn<S>(&self, store: Arc<S>) -> Option<CleanupScheduler>
    where
        S: WindowStore + ?Sized + 'static,
    {
        self.enabled
            .then(|| CleanupScheduler::spawn(store, self.queue_capacity))
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl SlidegateConfig {
    /// Load configuration from a YAML file, then apply `SLIDEGATE__*`
    /// environment overrides.
    ///
    /// Policies are always taken from the file as written: their names are
    /// case sensitive and environment overrides do not apply to them.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SlidegateError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("configuration file not found: {}", path.display()),
            )));
        }

        let contents = std::fs::read_to_string(path)?;
        let settings = ::config::Config::builder()
            .add_source(::config::File::from_str(
                &contents,
                ::config::FileFormat::Yaml,
            ))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| SlidegateError::Config(e.to_string()))?;

        let mut config: SlidegateConfig = settings
            .try_deserialize()
            .map_err(|e| SlidegateError::Config(e.to_string()))?;

        // The config crate lowercases every map key it reads.
        config.policies = PolicySet::from_yaml(&contents)?.policies;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: SlidegateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| SlidegateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// The configured policies as a [`PolicySet`].
    pub fn policy_set(&self) -> PolicySet {
        PolicySet {
            policies: self.policies.clone(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.cleanup.queue_capacity == 0 {
            return Err(SlidegateError::Config(
                "cleanup.queue_capacity must be at least 1".to_string(),
            ));
        }
        self.policy_set().validate()
    }
}
