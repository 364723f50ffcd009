//! Slow-start ramp for newly observed principals.

use std::sync::Arc;

use tracing::debug;

use super::backend::AtomicStore;
use super::keys;
use super::rules::SlowStartConfig;
use crate::error::Result;

/// Derives a principal's capacity multiplier from when it was first seen.
///
/// First-seen records live in the same store as the buckets, under the
/// `slowstart:` key namespace.
pub struct SlowStartTracker {
    store: Arc<dyn AtomicStore>,
}

impl SlowStartTracker {
    pub fn new(store: Arc<dyn AtomicStore>) -> Self {
        Self { store }
    }

    /// Multiplier in `[start_multiplier, 1.0]` for `principal` at `now`.
    ///
    /// The first call for a principal records `now` as its first-seen time
    /// and returns `start_multiplier`.
    pub async fn effective_multiplier(
        &self,
        principal: &str,
        now: f64,
        config: &SlowStartConfig,
    ) -> Result<f64> {
        if !config.enabled {
            return Ok(1.0);
        }

        let key = keys::slow_start(principal);
        let first_seen_at = self
            .store
            .first_seen(&key, now, config.record_ttl_secs())
            .await?;

        let multiplier = ramp(now - first_seen_at, config);
        if first_seen_at == now {
            debug!(
                principal = %principal,
                multiplier = multiplier,
                "New principal entering slow start"
            );
        }
        Ok(multiplier)
    }
}

/// Linear ramp from `start_multiplier` to 1.0 over `duration` seconds.
fn ramp(elapsed: f64, config: &SlowStartConfig) -> f64 {
    let duration = config.duration as f64;
    let elapsed = elapsed.max(0.0);
    if elapsed >= duration {
        return 1.0;
    }
    let start = config.start_multiplier;
    (start + (elapsed / duration) * (1.0 - start)).clamp(start, 1.0)
}
