//! The rate limit decision engine.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use super::backend::AtomicStore;
use super::bucket::{BucketParams, Consumption};
use super::keys;
use super::recorder::{SecurityEvent, UsageRecorder, UsageStats};
use super::rules::{QuotaConfig, UNLIMITED_TIER};
use super::slow_start::SlowStartTracker;
use crate::clock::Clock;
use crate::error::{Result, TollgateError};

/// Remaining quota reported for endpoints without a configured quota.
pub const UNCONFIGURED_REMAINING: f64 = 1_000_000.0;

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Decision {
    /// Whether the request is admitted
    pub allowed: bool,
    /// Tokens left after this request (infinite for the unlimited tier)
    pub remaining: f64,
    /// Seconds to wait before retrying; zero when admitted
    pub retry_after: f64,
}

impl Decision {
    /// An admitted request.
    pub fn allowed(remaining: f64) -> Self {
        Self {
            allowed: true,
            remaining,
            retry_after: 0.0,
        }
    }

    /// A denied request.
    pub fn denied(remaining: f64, retry_after: f64) -> Self {
        Self {
            allowed: false,
            remaining,
            retry_after,
        }
    }

    /// Admission without any limit.
    pub fn unlimited() -> Self {
        Self::allowed(f64::INFINITY)
    }

    /// Whole seconds to wait, rounded up (for `Retry-After` style headers).
    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after.max(0.0).ceil() as u64
    }
}

impl From<Consumption> for Decision {
    fn from(consumption: Consumption) -> Self {
        Self {
            allowed: consumption.allowed,
            remaining: consumption.remaining,
            retry_after: consumption.retry_after,
        }
    }
}

/// Admission-control engine.
///
/// Composes bucket parameters from the active [`QuotaConfig`] and the
/// slow-start ramp, runs check-and-consume on the injected store, and reports
/// every outcome to the [`UsageRecorder`]. Store faults never turn into
/// denials: the engine fails open and reports the fault instead.
pub struct RateLimitEngine {
    /// Active quota tables, swapped whole on reconfiguration
    config: RwLock<Arc<QuotaConfig>>,
    /// Bucket and first-seen state
    store: Arc<dyn AtomicStore>,
    slow_start: SlowStartTracker,
    recorder: Arc<UsageRecorder>,
    clock: Arc<dyn Clock>,
}

impl RateLimitEngine {
    /// Create an engine over `store` with an initial configuration.
    pub fn new(
        config: QuotaConfig,
        store: Arc<dyn AtomicStore>,
        recorder: Arc<UsageRecorder>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config: RwLock::new(Arc::new(config)),
            slow_start: SlowStartTracker::new(store.clone()),
            store,
            recorder,
            clock,
        }
    }

    /// Decide whether `principal` may call `endpoint` now.
    ///
    /// `request_cost` multiplies the endpoint's configured cost; zero is
    /// treated as one. Denial is a normal [`Decision`], never an error.
    pub async fn check_rate_limit(
        &self,
        principal: &str,
        endpoint: &str,
        tier: &str,
        region: &str,
        request_cost: u64,
    ) -> Decision {
        // One snapshot for the whole check.
        let config = self.config();
        let decision = self
            .decide(&config, principal, endpoint, tier, region, request_cost.max(1))
            .await;

        let (endpoint_label, tier_label, region_label) =
            config.usage_dimensions(endpoint, tier, region);
        self.recorder
            .track(principal, endpoint_label, tier_label, region_label, decision.allowed);
        decision
    }

    async fn decide(
        &self,
        config: &QuotaConfig,
        principal: &str,
        endpoint: &str,
        tier: &str,
        region: &str,
        request_cost: u64,
    ) -> Decision {
        if tier == UNLIMITED_TIER {
            return Decision::unlimited();
        }

        let Some(quota) = config.endpoint(endpoint).copied() else {
            trace!(endpoint = %endpoint, "No quota configured, admitting");
            return Decision::allowed(UNCONFIGURED_REMAINING);
        };

        let now = self.clock.now();
        let tier_multiplier = config.tier_multiplier(tier);
        let region_multiplier = config.region_multiplier(region);

        let slow_start_multiplier = match self
            .slow_start
            .effective_multiplier(principal, now, &config.slow_start)
            .await
        {
            Ok(multiplier) => multiplier,
            Err(e) => {
                let capacity = quota.capacity(tier_multiplier, region_multiplier, 1.0);
                return self.fail_open("slow_start", capacity, e);
            }
        };

        let params = BucketParams {
            capacity: quota.capacity(tier_multiplier, region_multiplier, slow_start_multiplier),
            rate: quota.rate(),
            cost: quota.cost.saturating_mul(request_cost) as f64,
            ttl_secs: quota.ttl_secs(),
        };
        let key = keys::bucket(principal, endpoint);

        trace!(
            key = %key,
            capacity = params.capacity,
            rate = params.rate,
            cost = params.cost,
            slow_start = slow_start_multiplier,
            "Checking rate limit"
        );

        match self.store.check_and_consume(&key, now, &params).await {
            Ok(consumption) => {
                let decision = Decision::from(consumption);
                if !decision.allowed {
                    debug!(
                        key = %key,
                        remaining = decision.remaining,
                        retry_after = decision.retry_after,
                        "Rate limit exceeded"
                    );
                }
                decision
            }
            Err(e) => self.fail_open("check_and_consume", params.capacity, e),
        }
    }

    fn fail_open(&self, context: &str, capacity: f64, error: TollgateError) -> Decision {
        self.recorder.record_error(context, &error);
        Decision::allowed(capacity)
    }

    /// Replace the quota tables from an update payload.
    ///
    /// Returns `false` and keeps the current tables when the payload lacks
    /// `endpoints` or `tiers` or fails validation.
    pub fn update_config(&self, update: serde_json::Value) -> bool {
        match QuotaConfig::from_update(update) {
            Ok(config) => {
                self.swap_config(config);
                true
            }
            Err(e) => {
                warn!(error = %e, "Rejected quota configuration update");
                false
            }
        }
    }

    /// Replace the quota tables with an already-built configuration.
    pub fn set_config(&self, config: QuotaConfig) -> Result<()> {
        config.validate()?;
        self.swap_config(config);
        Ok(())
    }

    fn swap_config(&self, config: QuotaConfig) {
        info!(
            endpoints = config.endpoints.len(),
            tiers = config.tiers.len(),
            regions = config.regions.len(),
            "Quota configuration updated"
        );
        *self.config.write() = Arc::new(config);
    }

    /// The active quota tables.
    pub fn config(&self) -> Arc<QuotaConfig> {
        self.config.read().clone()
    }

    /// Aggregated usage; `None` filters match anything.
    pub fn stats(
        &self,
        endpoint: Option<&str>,
        tier: Option<&str>,
        region: Option<&str>,
    ) -> UsageStats {
        self.recorder.stats(endpoint, tier, region)
    }

    /// The most recent `limit` security events, newest last.
    pub fn security_log(&self, limit: usize) -> Vec<SecurityEvent> {
        self.recorder.security_log(limit)
    }

    /// The recorder receiving this engine's outcomes.
    pub fn recorder(&self) -> &Arc<UsageRecorder> {
        &self.recorder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::keys::UNCONFIGURED;
    use crate::ratelimit::local::LocalStore;
    use crate::ratelimit::recorder::SecurityConfig;
    use crate::ratelimit::rules::{EndpointQuota, SlowStartConfig};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;

    /// Store that always fails, for fail-open paths.
    struct BrokenStore;

    #[async_trait]
    impl AtomicStore for BrokenStore {
        async fn check_and_consume(
            &self,
            _: &str,
            _: f64,
            _: &BucketParams,
        ) -> Result<Consumption> {
            Err(TollgateError::StoreUnavailable("down".to_string()))
        }

        async fn first_seen(&self, _: &str, now: f64, _: u64) -> Result<f64> {
            Ok(now - 1e6)
        }
    }

    fn quota_config() -> QuotaConfig {
        QuotaConfig {
            endpoints: HashMap::from([(
                "checkout".to_string(),
                EndpointQuota {
                    requests: 10,
                    window: 60,
                    burst: 2,
                    cost: 5,
                },
            )]),
            tiers: HashMap::from([("free".to_string(), 1.0), ("premium".to_string(), 2.0)]),
            regions: HashMap::from([("default".to_string(), 1.0), ("apac".to_string(), 0.5)]),
            slow_start: SlowStartConfig::disabled(),
        }
    }

    fn engine_with(store: Arc<dyn AtomicStore>) -> (RateLimitEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(10_000.0));
        let recorder = Arc::new(UsageRecorder::new(SecurityConfig::default(), clock.clone()));
        (
            RateLimitEngine::new(quota_config(), store, recorder, clock.clone()),
            clock,
        )
    }

    fn engine() -> (RateLimitEngine, Arc<ManualClock>) {
        engine_with(Arc::new(LocalStore::default()))
    }

    #[tokio::test]
    async fn test_checkout_scenario() {
        let (engine, _) = engine();

        let first = engine.check_rate_limit("u1", "checkout", "free", "default", 1).await;
        assert_eq!(first, Decision::allowed(7.0));

        let second = engine.check_rate_limit("u1", "checkout", "free", "default", 1).await;
        assert_eq!(second, Decision::allowed(2.0));

        let third = engine.check_rate_limit("u1", "checkout", "free", "default", 1).await;
        assert!(!third.allowed);
        assert_eq!(third.retry_after, 18.0);
        assert_eq!(third.retry_after_secs(), 18);
    }

    #[tokio::test]
    async fn test_tier_and_region_scale_capacity() {
        let (engine, _) = engine();

        // premium: 10*2 + 2*2 = 24
        let premium = engine.check_rate_limit("p", "checkout", "premium", "default", 1).await;
        assert_eq!(premium.remaining, 19.0);

        // apac: floor(10*0.5) + 2 = 7
        let apac = engine.check_rate_limit("a", "checkout", "free", "apac", 1).await;
        assert_eq!(apac.remaining, 2.0);

        // unknown tier and region fall back to 1
        let unknown = engine.check_rate_limit("x", "checkout", "gold", "mars", 1).await;
        assert_eq!(unknown.remaining, 7.0);
    }

    #[tokio::test]
    async fn test_request_cost_multiplies_configured_cost() {
        let (engine, _) = engine();

        let decision = engine.check_rate_limit("u", "checkout", "free", "default", 2).await;
        assert_eq!(decision.remaining, 2.0);

        // zero counts as one
        let decision = engine.check_rate_limit("v", "checkout", "free", "default", 0).await;
        assert_eq!(decision.remaining, 7.0);
    }

    #[tokio::test]
    async fn test_refill_over_time() {
        let (engine, clock) = engine();

        engine.check_rate_limit("u", "checkout", "free", "default", 1).await;
        engine.check_rate_limit("u", "checkout", "free", "default", 1).await;

        // 24s at 1/6 token per second refills 4 tokens: 2 + 4 - 5 = 1
        clock.advance(24.0);
        let decision = engine.check_rate_limit("u", "checkout", "free", "default", 1).await;
        assert!(decision.allowed);
        assert!((decision.remaining - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_unlimited_tier_bypasses_everything() {
        let (engine, _) = engine();

        let decision = engine.check_rate_limit("u", "checkout", "unlimited", "default", 1).await;

        assert_eq!(decision, Decision::unlimited());
        assert!(decision.remaining.is_infinite());
        assert_eq!(engine.stats(None, Some("unlimited"), None).allowed, 1);
    }

    #[tokio::test]
    async fn test_unknown_endpoint_fails_open() {
        let (engine, _) = engine();

        let decision = engine.check_rate_limit("u", "nowhere", "free", "default", 1).await;

        assert_eq!(decision, Decision::allowed(UNCONFIGURED_REMAINING));
    }

    #[tokio::test]
    async fn test_undeclared_dimensions_share_one_counter() {
        let (engine, _) = engine();

        for i in 0..100 {
            let endpoint = format!("random-{}", i);
            let tier = format!("tier-{}", i);
            engine.check_rate_limit("u", &endpoint, &tier, "mars", 1).await;
        }
        engine.check_rate_limit("u", "checkout", "gold", "default", 1).await;

        assert_eq!(engine.recorder().counter_len(), 2);
        assert_eq!(
            engine.stats(Some(UNCONFIGURED), Some(UNCONFIGURED), Some(UNCONFIGURED)).allowed,
            100
        );
        assert_eq!(
            engine.stats(Some("checkout"), Some(UNCONFIGURED), Some("default")).allowed,
            1
        );
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let (engine, _) = engine_with(Arc::new(BrokenStore));

        let decision = engine.check_rate_limit("u", "checkout", "free", "default", 1).await;

        assert_eq!(decision, Decision::allowed(12.0));
        assert_eq!(engine.recorder().error_count(), 1);
        assert_eq!(engine.stats(None, None, None).allowed, 1);
    }

    #[tokio::test]
    async fn test_denials_are_recorded() {
        let (engine, _) = engine();

        for _ in 0..3 {
            engine.check_rate_limit("u", "checkout", "free", "default", 1).await;
        }

        assert_eq!(
            engine.stats(Some("checkout"), None, None),
            UsageStats { allowed: 2, blocked: 1 }
        );
        let log = engine.security_log(10);
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].principal, "u");
    }

    #[tokio::test]
    async fn test_update_config_swaps_tables() {
        let (engine, _) = engine();

        let accepted = engine.update_config(json!({
            "endpoints": { "checkout": { "requests": 100, "window": 60 } },
            "tiers": { "free": 1.0 },
            "slow_start": { "enabled": false },
        }));

        assert!(accepted);
        let decision = engine.check_rate_limit("u", "checkout", "free", "default", 1).await;
        assert_eq!(decision.remaining, 99.0);
    }

    #[tokio::test]
    async fn test_rejected_update_keeps_prior_config() {
        let (engine, _) = engine();
        let before = engine.config();

        assert!(!engine.update_config(json!({ "endpoints": null })));
        assert!(!engine.update_config(json!({
            "endpoints": { "checkout": { "requests": 0, "window": 60 } },
            "tiers": {},
        })));

        assert_eq!(*engine.config(), *before);
        let decision = engine.check_rate_limit("u", "checkout", "free", "default", 1).await;
        assert_eq!(decision.remaining, 7.0);
    }

    #[tokio::test]
    async fn test_slow_start_reduces_new_principal_capacity() {
        let (engine, clock) = engine();
        let mut config = quota_config();
        config.slow_start = SlowStartConfig {
            enabled: true,
            duration: 100,
            start_multiplier: 0.5,
        };
        engine.set_config(config).unwrap();

        // floor(10*0.5) + 2 = 7, minus cost 5
        let first = engine.check_rate_limit("new", "checkout", "free", "default", 1).await;
        assert_eq!(first.remaining, 2.0);

        clock.advance(100.0);
        let config = engine.config();
        let multiplier = engine
            .slow_start
            .effective_multiplier("new", clock.now(), &config.slow_start)
            .await
            .unwrap();
        assert_eq!(multiplier, 1.0);
    }

    #[test]
    fn test_decision_helpers() {
        assert_eq!(Decision::denied(0.5, 2.4).retry_after_secs(), 3);
        assert_eq!(Decision::allowed(3.0).retry_after_secs(), 0);
        assert!(Decision::unlimited().allowed);
    }
}
