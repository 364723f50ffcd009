//! Redis-backed shared state store.
//!
//! Check-and-consume runs as one Lua script, so Redis executes the whole
//! read-refill-consume-write sequence without interleaving other clients.
//! Token counts travel as `%.17g` strings to keep the script's arithmetic
//! identical to [`BucketState::refill_and_consume`].
//!
//! [`BucketState::refill_and_consume`]: super::bucket::BucketState::refill_and_consume

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Script};
use tracing::{debug, info, trace, warn};

use super::backend::{AtomicStore, SharedBackend};
use super::bucket::{BucketParams, Consumption};
use crate::error::{Result, TollgateError};

/// KEYS[1] = bucket key
/// ARGV = capacity, rate, cost, now, ttl
const CHECK_AND_CONSUME_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local cost = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])

local state = redis.call('HMGET', KEYS[1], 'tokens', 'last_refill')
local tokens = tonumber(state[1])
local last_refill = tonumber(state[2])
if tokens == nil or last_refill == nil then
  tokens = capacity
  last_refill = now
end

local elapsed = math.max(0, now - last_refill)
tokens = math.min(capacity, tokens + elapsed * rate)

local allowed = 0
local retry_after = 0
if tokens >= cost then
  tokens = tokens - cost
  allowed = 1
else
  retry_after = math.ceil((cost - tokens) / rate)
end

redis.call('HSET', KEYS[1],
  'tokens', string.format('%.17g', tokens),
  'last_refill', string.format('%.17g', math.max(last_refill, now)))
redis.call('EXPIRE', KEYS[1], ttl)

return {tostring(allowed), string.format('%.17g', tokens), string.format('%.17g', retry_after)}
"#;

/// Shared [`AtomicStore`] on top of a Redis connection manager.
pub struct RedisStore {
    connection: ConnectionManager,
    script: Script,
    healthy: AtomicBool,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("healthy", &self.is_healthy())
            .finish()
    }
}

impl RedisStore {
    /// Connect to Redis at `url`.
    ///
    /// Fails when the URL is invalid or the first connection cannot be made;
    /// callers are expected to fall back to the local store in that case.
    pub async fn connect(url: &str) -> Result<Self> {
        info!(url = %sanitize_url(url), "Connecting to shared state store");

        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;

        info!("Shared state store connected");
        Ok(Self {
            connection,
            script: Script::new(CHECK_AND_CONSUME_SCRIPT),
            healthy: AtomicBool::new(true),
        })
    }

    /// Map a Redis failure into a store error, clearing the health flag when
    /// the connection itself is the problem.
    fn fail(&self, op: &str, err: RedisError) -> TollgateError {
        if is_connection_error(&err) {
            if self.healthy.swap(false, Ordering::SeqCst) {
                warn!(op = op, error = %err, "Shared state store marked unhealthy");
            }
        } else {
            debug!(op = op, error = %err, "Shared state store operation failed");
        }
        TollgateError::StoreUnavailable(format!("{}: {}", op, err))
    }
}

#[async_trait]
impl AtomicStore for RedisStore {
    async fn check_and_consume(
        &self,
        key: &str,
        now: f64,
        params: &BucketParams,
    ) -> Result<Consumption> {
        let mut conn = self.connection.clone();

        trace!(key = %key, now = now, "Running check-and-consume script");

        let reply: Vec<String> = self
            .script
            .key(key)
            .arg(params.capacity.to_string())
            .arg(params.rate.to_string())
            .arg(params.cost.to_string())
            .arg(now.to_string())
            .arg(params.ttl_secs)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.fail("check_and_consume", e))?;

        parse_script_reply(&reply)
    }

    async fn first_seen(&self, key: &str, now: f64, ttl_secs: u64) -> Result<f64> {
        let mut conn = self.connection.clone();

        let stored: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.fail("first_seen", e))?;

        if let Some(value) = stored.as_deref().and_then(|v| v.parse::<f64>().ok()) {
            return Ok(value);
        }

        // Not atomic with the GET: two first observations may both write.
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(now.to_string())
            .arg("EX")
            .arg(ttl_secs.max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| self.fail("first_seen", e))?;

        Ok(now)
    }
}

#[async_trait]
impl SharedBackend for RedisStore {
    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// PING the server. The connection manager reconnects on its own; this
    /// is what lets routing return to Redis once it has.
    async fn check_health(&self) -> bool {
        let mut conn = self.connection.clone();
        let reply: std::result::Result<String, RedisError> =
            redis::cmd("PING").query_async(&mut conn).await;

        let healthy = reply.is_ok();
        let was = self.healthy.swap(healthy, Ordering::SeqCst);
        if was != healthy {
            info!(healthy = healthy, "Shared state store health changed");
        }
        healthy
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

fn is_connection_error(err: &RedisError) -> bool {
    err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
}

/// Parse `{allowed, remaining, retry_after}` as returned by the script.
fn parse_script_reply(reply: &[String]) -> Result<Consumption> {
    let [allowed, remaining, retry_after] = reply else {
        return Err(TollgateError::StoreUnavailable(format!(
            "unexpected script reply with {} fields",
            reply.len()
        )));
    };

    let number = |field: &str, value: &str| {
        value.parse::<f64>().map_err(|_| {
            let reason = format!("invalid {} in script reply: {:?}", field, value);
            TollgateError::StoreUnavailable(reason)
        })
    };

    Ok(Consumption {
        allowed: allowed.as_str() == "1",
        remaining: number("remaining", remaining.as_str())?,
        retry_after: number("retry_after", retry_after.as_str())?,
    })
}

/// Hide any password in a Redis URL before logging it.
fn sanitize_url(url: &str) -> String {
    match url.rsplit_once('@') {
        Some((credentials, host)) => match credentials.split_once("://") {
            Some((scheme, _)) => format!("{}://***@{}", scheme, host),
            None => format!("***@{}", host),
        },
        None => url.to_string(),
    }
}
