//! Rate limiting logic and state management.

mod backend;
mod bucket;
mod failover;
pub mod keys;
mod limiter;
mod local;
mod recorder;
mod rules;
#[cfg(feature = "redis")]
mod shared;
mod slow_start;

pub use backend::{AtomicStore, SharedBackend};
pub use bucket::{BucketParams, BucketState, Consumption};
pub use failover::{FailoverStore, StoreRoute};
pub use limiter::{Decision, RateLimitEngine, UNCONFIGURED_REMAINING};
pub use local::{LocalStore, DEFAULT_LOCK_TIMEOUT};
pub use recorder::{
    SecurityConfig, SecurityEvent, SuspiciousActivity, UsageRecorder, UsageStats,
    RATE_LIMIT_EXCEEDED,
};
pub use rules::{EndpointQuota, QuotaConfig, SlowStartConfig, UNLIMITED_TIER};
#[cfg(feature = "redis")]
pub use shared::RedisStore;
pub use slow_start::SlowStartTracker;
