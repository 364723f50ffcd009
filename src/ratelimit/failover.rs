//! Per-call routing between the shared backend and the local fallback.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::backend::{AtomicStore, SharedBackend};
use super::bucket::{BucketParams, Consumption};
use super::local::LocalStore;
use crate::error::Result;

/// Which backend serves a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreRoute {
    Shared,
    Local,
}

/// [`AtomicStore`] that prefers a healthy shared backend and falls back to
/// the local store whenever it is unhealthy or fails.
///
/// Routing is decided again on every call from the backend's health flag;
/// nothing is sticky and failed calls are not retried against the shared
/// backend.
pub struct FailoverStore {
    shared: Option<Arc<dyn SharedBackend>>,
    local: Arc<LocalStore>,
}

impl FailoverStore {
    /// Route between `shared` and `local`.
    pub fn new(shared: Arc<dyn SharedBackend>, local: Arc<LocalStore>) -> Self {
        Self {
            shared: Some(shared),
            local,
        }
    }

    /// Use only the local store.
    pub fn local_only(local: Arc<LocalStore>) -> Self {
        Self { shared: None, local }
    }

    /// The backend the next call would go to.
    pub fn route(&self) -> StoreRoute {
        match &self.shared {
            Some(shared) if shared.is_healthy() => StoreRoute::Shared,
            _ => StoreRoute::Local,
        }
    }

    /// The local fallback store.
    pub fn local(&self) -> &Arc<LocalStore> {
        &self.local
    }

    /// Check the shared backend every `every` so that routing returns to it
    /// after an outage. `None` when there is no shared backend.
    ///
    /// The task stops on its own once the backend is dropped.
    pub fn spawn_health_check(&self, every: Duration) -> Option<JoinHandle<()>> {
        let shared = Arc::downgrade(self.shared.as_ref()?);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // The first tick fires immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(shared) = shared.upgrade() else {
                    debug!("Shared backend dropped, stopping health checks");
                    return;
                };
                let healthy = shared.check_health().await;
                trace!(backend = shared.name(), healthy = healthy, "Checked shared backend health");
            }
        }))
    }

    fn healthy_shared(&self) -> Option<&Arc<dyn SharedBackend>> {
        self.shared.as_ref().filter(|shared| shared.is_healthy())
    }
}

#[async_trait]
impl AtomicStore for FailoverStore {
    async fn check_and_consume(
        &self,
        key: &str,
        now: f64,
        params: &BucketParams,
    ) -> Result<Consumption> {
        if let Some(shared) = self.healthy_shared() {
            match shared.check_and_consume(key, now, params).await {
                Ok(consumption) => return Ok(consumption),
                Err(e) => warn!(
                    backend = shared.name(),
                    key = %key,
                    error = %e,
                    "Shared store failed, using local fallback"
                ),
            }
        }

        trace!(key = %key, "Serving check from local store");
        self.local.check_and_consume(key, now, params).await
    }

    async fn first_seen(&self, key: &str, now: f64, ttl_secs: u64) -> Result<f64> {
        if let Some(shared) = self.healthy_shared() {
            match shared.first_seen(key, now, ttl_secs).await {
                Ok(first_seen) => return Ok(first_seen),
                Err(e) => warn!(
                    backend = shared.name(),
                    key = %key,
                    error = %e,
                    "Shared store failed, using local fallback"
                ),
            }
        }

        self.local.first_seen(key, now, ttl_secs).await
    }
}
