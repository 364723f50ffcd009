//! Error types for Tollgate.

use thiserror::Error;

/// Main error type for Tollgate operations.
///
/// None of these reach a caller of
/// [`RateLimitEngine::check_rate_limit`](crate::ratelimit::RateLimitEngine::check_rate_limit):
/// the engine converts every store fault into a fail-open decision.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration file could not be read or parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// A quota table failed validation and was not applied
    #[error("Configuration rejected: {0}")]
    ConfigRejected(String),

    /// The shared backend could not serve the request
    #[error("State store unavailable: {0}")]
    StoreUnavailable(String),

    /// The local fallback could not acquire a key's lock in time
    #[error("Timed out after {waited_ms}ms waiting for lock on {key}")]
    LockTimeout { key: String, waited_ms: u64 },

    /// Redis client errors
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
