//! Persisted key layout.
//!
//! Keys are backend-agnostic: the same strings address state in the local
//! fallback and in the shared backend.

use std::fmt;

/// Key of the token bucket owned by a `(principal, endpoint)` pair.
pub fn bucket(principal: &str, endpoint: &str) -> String {
    format!("ratelimit:{}:{}", principal, endpoint)
}

/// Key of a principal's first-seen record.
pub fn slow_start(principal: &str) -> String {
    format!("slowstart:{}", principal)
}

/// Usage counter label standing in for an endpoint, tier or region that the
/// active configuration does not declare.
pub const UNCONFIGURED: &str = "unconfigured";

/// Outcome bucket of a usage counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Allowed,
    Blocked,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Allowed => "allowed",
            Outcome::Blocked => "blocked",
        }
    }
}

/// Dimensions of a usage counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UsageKey {
    pub endpoint: String,
    pub tier: String,
    pub region: String,
}

impl UsageKey {
    pub fn new(endpoint: &str, tier: &str, region: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            tier: tier.to_string(),
            region: region.to_string(),
        }
    }

    /// Full counter name for one outcome,
    /// `analytics:<endpoint>:<tier>:<region>:<allowed|blocked>`.
    pub fn counter_name(&self, outcome: Outcome) -> String {
        format!("{}:{}", self, outcome.as_str())
    }

    /// Whether this key matches a filter where `None` means "any".
    pub fn matches(
        &self,
        endpoint: Option<&str>,
        tier: Option<&str>,
        region: Option<&str>,
    ) -> bool {
        endpoint.map_or(true, |e| e == self.endpoint)
            && tier.map_or(true, |t| t == self.tier)
            && region.map_or(true, |r| r == self.region)
    }
}

impl fmt::Display for UsageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "analytics:{}:{}:{}", self.endpoint, self.tier, self.region)
    }
}
