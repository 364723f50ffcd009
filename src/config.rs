//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, TollgateError};
use crate::ratelimit::{QuotaConfig, SecurityConfig};

/// Prefix of environment variables overriding file settings,
/// e.g. `TOLLGATE__STORE__REDIS_URL`.
pub const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for a Tollgate process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// State store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Usage and security recording configuration
    #[serde(default)]
    pub security: SecurityConfig,

    /// Quota tables
    #[serde(default)]
    pub quotas: QuotaConfig,
}

/// State store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis URL of the shared backend; local-only when unset
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Bound on waiting for a local bucket lock, in milliseconds
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Interval between local expiry sweeps, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Interval between shared backend health checks, in seconds
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            lock_timeout_ms: default_lock_timeout_ms(),
            sweep_interval_secs: default_sweep_interval(),
            health_interval_secs: default_health_interval(),
        }
    }
}

fn default_lock_timeout_ms() -> u64 {
    1000
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_health_interval() -> u64 {
    5
}

impl StoreConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }
}

impl AppConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate configuration from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: AppConfig =
            serde_yaml::from_str(yaml).map_err(|e| TollgateError::Config(e.to_string()))?;
        config.quotas.validate()?;
        Ok(config)
    }

    /// Load a configuration file and apply `TOLLGATE__*` environment
    /// overrides on top of it.
    pub fn load(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| TollgateError::Config(e.to_string()))?;

        let config: AppConfig = settings
            .try_deserialize()
            .map_err(|e| TollgateError::Config(e.to_string()))?;
        config.quotas.validate()?;
        Ok(config)
    }
}
