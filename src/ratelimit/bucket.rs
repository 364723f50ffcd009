//! Token bucket state and refill arithmetic.
//!
//! Both state store backends run exactly this arithmetic (the shared backend
//! runs a Lua transcription of it), so a key sees the same token counts no
//! matter which backend served a given call.

use serde::{Deserialize, Serialize};

/// Stored state of one token bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    /// Tokens currently available, `0 <= tokens <= capacity`
    pub tokens: f64,
    /// Time of the last refill, in seconds since the epoch
    pub last_refill_at: f64,
}

/// Parameters of a single check-and-consume call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketParams {
    /// Maximum tokens the bucket may hold
    pub capacity: f64,
    /// Refill speed in tokens per second
    pub rate: f64,
    /// Tokens this request consumes
    pub cost: f64,
    /// Idle lifetime of the bucket, in seconds
    pub ttl_secs: u64,
}

/// Result of a check-and-consume call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Consumption {
    pub allowed: bool,
    pub remaining: f64,
    pub retry_after: f64,
}

impl BucketState {
    /// A bucket seen for the first time starts full.
    pub fn full(capacity: f64, now: f64) -> Self {
        Self {
            tokens: capacity,
            last_refill_at: now,
        }
    }

    /// Refill for the elapsed time, then try to take `params.cost` tokens.
    ///
    /// Clock regressions count as zero elapsed time and never move
    /// `last_refill_at` backwards.
    pub fn refill_and_consume(&mut self, now: f64, params: &BucketParams) -> Consumption {
        let elapsed = (now - self.last_refill_at).max(0.0);
        let mut tokens = params.capacity.min(self.tokens + elapsed * params.rate);

        let consumption = if tokens >= params.cost {
            tokens -= params.cost;
            Consumption {
                allowed: true,
                remaining: tokens,
                retry_after: 0.0,
            }
        } else {
            Consumption {
                allowed: false,
                remaining: tokens,
                retry_after: ((params.cost - tokens) / params.rate).ceil(),
            }
        };

        self.tokens = tokens;
        self.last_refill_at = self.last_refill_at.max(now);
        consumption
    }
}

/// Run one check-and-consume against an optional existing state.
///
/// Returns the state to store back along with the outcome.
pub fn check_and_consume(
    state: Option<BucketState>,
    now: f64,
    params: &BucketParams,
) -> (BucketState, Consumption) {
    let mut state = state.unwrap_or_else(|| BucketState::full(params.capacity, now));
    let consumption = state.refill_and_consume(now, params);
    (state, consumption)
}
