//! State store traits shared by the local fallback and the shared backend.

use async_trait::async_trait;

use super::bucket::{BucketParams, Consumption};
use crate::error::Result;

/// Key-addressed store of bucket state with an indivisible
/// read-refill-consume-write operation.
///
/// Two concurrent calls for the same key never observe the same pre-update
/// token count. Calls for different keys do not serialize against each other.
#[async_trait]
pub trait AtomicStore: Send + Sync {
    /// Refill and consume from the bucket at `key`, creating it full when
    /// absent, and push its expiry out to `params.ttl_secs`.
    async fn check_and_consume(&self, key: &str, now: f64, params: &BucketParams)
        -> Result<Consumption>;

    /// Return the first-seen timestamp stored at `key`, recording `now`
    /// (with a lifetime of `ttl_secs`) when nothing is stored yet.
    ///
    /// Two racing first observations may both write; the last one wins.
    async fn first_seen(&self, key: &str, now: f64, ttl_secs: u64) -> Result<f64>;
}

/// A remote store that reports its own health.
#[async_trait]
pub trait SharedBackend: AtomicStore {
    /// Cheap, side-effect free health check, consulted on every call.
    fn is_healthy(&self) -> bool;

    /// Round-trip to the backend and update the health flag from the answer.
    async fn check_health(&self) -> bool;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}
