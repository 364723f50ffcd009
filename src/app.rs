//! Assembly of a Tollgate engine from configuration.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use crate::clock::Clock;
use crate::config::AppConfig;
use crate::ratelimit::{FailoverStore, LocalStore, RateLimitEngine, StoreRoute, UsageRecorder};

/// A running engine together with the resources it owns.
pub struct Tollgate {
    engine: Arc<RateLimitEngine>,
    store: Arc<FailoverStore>,
    sweeper: JoinHandle<()>,
    health_check: Option<JoinHandle<()>>,
}

impl Tollgate {
    /// Build the stores, recorder and engine described by `config`.
    ///
    /// When a shared backend is configured but cannot be reached, the engine
    /// starts on the local store alone. A connected backend is health-checked every
    /// `store.health_interval_secs` so that routing returns to it after an
    /// outage. Must run inside a Tokio runtime.
    pub async fn build(config: &AppConfig, clock: Arc<dyn Clock>) -> Self {
        let local = Arc::new(LocalStore::new(config.store.lock_timeout()));
        let sweeper = local.spawn_sweeper(clock.clone(), config.store.sweep_interval());

        let store = Arc::new(Self::select_store(config, local).await);
        let health_check = store.spawn_health_check(config.store.health_interval());
        info!(route = ?store.route(), "State store ready");

        let recorder = Arc::new(UsageRecorder::new(config.security.clone(), clock.clone()));
        let engine = Arc::new(RateLimitEngine::new(
            config.quotas.clone(),
            store.clone(),
            recorder,
            clock,
        ));

        Self {
            engine,
            store,
            sweeper,
            health_check,
        }
    }

    #[cfg(feature = "redis")]
    async fn select_store(config: &AppConfig, local: Arc<LocalStore>) -> FailoverStore {
        use crate::ratelimit::RedisStore;
        use tracing::warn;

        let Some(url) = config.store.redis_url.as_deref() else {
            return FailoverStore::local_only(local);
        };

        match RedisStore::connect(url).await {
            Ok(redis) => FailoverStore::new(Arc::new(redis), local),
            Err(e) => {
                warn!(error = %e, "Shared state store unreachable, using local store only");
                FailoverStore::local_only(local)
            }
        }
    }

    #[cfg(not(feature = "redis"))]
    async fn select_store(config: &AppConfig, local: Arc<LocalStore>) -> FailoverStore {
        if config.store.redis_url.is_some() {
            tracing::warn!("Built without the redis feature, ignoring store.redis_url");
        }
        FailoverStore::local_only(local)
    }

    pub fn engine(&self) -> &Arc<RateLimitEngine> {
        &self.engine
    }

    /// The backend the next check would use.
    pub fn route(&self) -> StoreRoute {
        self.store.route()
    }

    /// Stop background work.
    pub fn shutdown(self) {
        self.sweeper.abort();
        if let Some(health_check) = self.health_check {
            health_check.abort();
        }
        info!("Tollgate stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn test_build_local_only() {
        let config = AppConfig::from_yaml(
            r#"
quotas:
  endpoints:
    search:
      requests: 3
      window: 60
  tiers: {}
  slow_start:
    enabled: false
"#,
        )
        .unwrap();

        let tollgate = Tollgate::build(&config, Arc::new(ManualClock::new(0.0))).await;
        assert_eq!(tollgate.route(), StoreRoute::Local);
        assert!(tollgate.health_check.is_none());

        let engine = tollgate.engine().clone();
        for _ in 0..3 {
            assert!(engine.check_rate_limit("p", "search", "free", "eu", 1).await.allowed);
        }
        assert!(!engine.check_rate_limit("p", "search", "free", "eu", 1).await.allowed);

        tollgate.shutdown();
    }

    #[cfg(feature = "redis")]
    #[tokio::test]
    async fn test_unreachable_shared_store_falls_back_to_local() {
        let mut config = AppConfig::default();
        config.store.redis_url = Some("not a redis url".to_string());

        let tollgate = Tollgate::build(&config, Arc::new(ManualClock::new(0.0))).await;
        assert_eq!(tollgate.route(), StoreRoute::Local);
        tollgate.shutdown();
    }
}
