//! Quota tables: per-endpoint quotas, tier and region multipliers, and
//! slow-start parameters.
//!
//! A [`QuotaConfig`] is immutable once built. Reconfiguration replaces the
//! whole table; see [`RateLimitEngine::update_config`](super::RateLimitEngine::update_config).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use super::keys::UNCONFIGURED;
use crate::error::{Result, TollgateError};

/// Tier name that bypasses rate limiting entirely.
pub const UNLIMITED_TIER: &str = "unlimited";

/// Quota of a single endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointQuota {
    /// Requests admitted per window at multiplier 1
    pub requests: u64,
    /// Window length in seconds
    pub window: u64,
    /// Extra capacity above `requests` for short spikes
    #[serde(default)]
    pub burst: u64,
    /// Tokens consumed by one request of unit cost
    #[serde(default = "default_cost")]
    pub cost: u64,
}

fn default_cost() -> u64 {
    1
}

impl EndpointQuota {
    /// Refill speed in tokens per second, from the unscaled base rate.
    pub fn rate(&self) -> f64 {
        self.requests as f64 / self.window as f64
    }

    /// Bucket capacity for the given multipliers.
    ///
    /// The tier scales both the base and the burst; region and slow start
    /// scale only the base.
    pub fn capacity(&self, tier: f64, region: f64, slow_start: f64) -> f64 {
        let base = (self.requests as f64 * tier * region * slow_start).floor();
        base + (self.burst as f64 * tier).floor()
    }

    /// Idle lifetime of a bucket for this endpoint.
    pub fn ttl_secs(&self) -> u64 {
        self.window.saturating_mul(2)
    }

    fn validate(&self, endpoint: &str) -> Result<()> {
        if self.requests == 0 {
            return Err(rejected(format!("endpoint {endpoint}: requests must be positive")));
        }
        if self.window == 0 {
            return Err(rejected(format!("endpoint {endpoint}: window must be positive")));
        }
        if self.cost == 0 {
            return Err(rejected(format!("endpoint {endpoint}: cost must be positive")));
        }
        Ok(())
    }
}

/// Slow-start ramp for newly observed principals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SlowStartConfig {
    /// Whether new principals ramp up at all
    #[serde(default = "default_slow_start_enabled")]
    pub enabled: bool,
    /// Length of the ramp in seconds
    #[serde(default = "default_slow_start_duration")]
    pub duration: u64,
    /// Multiplier applied at first observation, in `(0, 1]`
    #[serde(default = "default_start_multiplier")]
    pub start_multiplier: f64,
}

impl Default for SlowStartConfig {
    fn default() -> Self {
        Self {
            enabled: default_slow_start_enabled(),
            duration: default_slow_start_duration(),
            start_multiplier: default_start_multiplier(),
        }
    }
}

fn default_slow_start_enabled() -> bool {
    true
}

fn default_slow_start_duration() -> u64 {
    300
}

fn default_start_multiplier() -> f64 {
    0.1
}

impl SlowStartConfig {
    /// A configuration that never ramps.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Lifetime of a first-seen record: twice the ramp, so the record
    /// outlives the point where the multiplier reaches 1.0.
    pub fn record_ttl_secs(&self) -> u64 {
        self.duration.saturating_mul(2)
    }

    fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.duration == 0 {
            return Err(rejected("slow_start: duration must be positive".to_string()));
        }
        if !(self.start_multiplier > 0.0 && self.start_multiplier <= 1.0) {
            return Err(rejected(format!(
                "slow_start: start_multiplier {} is outside (0, 1]",
                self.start_multiplier
            )));
        }
        Ok(())
    }
}

/// A complete, validated set of quota tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Endpoint name to quota
    #[serde(default)]
    pub endpoints: HashMap<String, EndpointQuota>,
    /// Tier name to capacity multiplier
    #[serde(default)]
    pub tiers: HashMap<String, f64>,
    /// Region name to capacity multiplier
    #[serde(default)]
    pub regions: HashMap<String, f64>,
    /// Slow-start ramp
    #[serde(default)]
    pub slow_start: SlowStartConfig,
}

/// Shape of a runtime configuration update.
///
/// `endpoints` and `tiers` are required; an update missing either (or
/// setting it to null) is rejected.
#[derive(Debug, Deserialize)]
struct QuotaConfigUpdate {
    endpoints: Option<HashMap<String, EndpointQuota>>,
    tiers: Option<HashMap<String, f64>>,
    #[serde(default)]
    regions: Option<HashMap<String, f64>>,
    #[serde(default)]
    slow_start: Option<SlowStartConfig>,
}

impl QuotaConfig {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load quota tables from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading quota configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate quota tables from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: QuotaConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse quota config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Build a replacement configuration from an update payload.
    ///
    /// Fails with [`TollgateError::ConfigRejected`] when `endpoints` or
    /// `tiers` is missing or null, or when any value fails validation.
    pub fn from_update(update: serde_json::Value) -> Result<Self> {
        let update: QuotaConfigUpdate = serde_json::from_value(update)
            .map_err(|e| rejected(format!("malformed update: {}", e)))?;

        let endpoints = update
            .endpoints
            .ok_or_else(|| rejected("update is missing the endpoints section".to_string()))?;
        let tiers = update
            .tiers
            .ok_or_else(|| rejected("update is missing the tiers section".to_string()))?;

        let config = QuotaConfig {
            endpoints,
            tiers,
            regions: update.regions.unwrap_or_default(),
            slow_start: update.slow_start.unwrap_or_default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check every quota and multiplier.
    pub fn validate(&self) -> Result<()> {
        for (endpoint, quota) in &self.endpoints {
            quota.validate(endpoint)?;
        }
        for (kind, table) in [("tier", &self.tiers), ("region", &self.regions)] {
            for (name, multiplier) in table {
                if !(multiplier.is_finite() && *multiplier > 0.0) {
                    return Err(rejected(format!(
                        "{kind} {name}: multiplier {multiplier} must be positive"
                    )));
                }
            }
        }
        self.slow_start.validate()
    }

    /// Quota of an endpoint, if configured.
    pub fn endpoint(&self, endpoint: &str) -> Option<&EndpointQuota> {
        self.endpoints.get(endpoint)
    }

    /// Usage counter dimensions for a check: names the configuration does not
    /// declare collapse into [`UNCONFIGURED`], so the counter set stays bounded
    /// by the configuration rather than by caller input.
    pub fn usage_dimensions<'a>(
        &self,
        endpoint: &'a str,
        tier: &'a str,
        region: &'a str,
    ) -> (&'a str, &'a str, &'a str) {
        let endpoint = if self.endpoints.contains_key(endpoint) {
            endpoint
        } else {
            UNCONFIGURED
        };
        let tier = if tier == UNLIMITED_TIER || self.tiers.contains_key(tier) {
            tier
        } else {
            UNCONFIGURED
        };
        let region = if self.regions.contains_key(region) {
            region
        } else {
            UNCONFIGURED
        };
        (endpoint, tier, region)
    }

    /// Multiplier of a tier; unknown tiers get 1.
    pub fn tier_multiplier(&self, tier: &str) -> f64 {
        self.tiers.get(tier).copied().unwrap_or(1.0)
    }

    /// Multiplier of a region; unknown regions get 1.
    pub fn region_multiplier(&self, region: &str) -> f64 {
        self.regions.get(region).copied().unwrap_or(1.0)
    }
}

fn rejected(reason: String) -> TollgateError {
    TollgateError::ConfigRejected(reason)
}
