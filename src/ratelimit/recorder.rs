//! Usage counters, the security event log, and suspicious-activity alerts.
//!
//! Nothing here is authoritative. Counter updates are best effort and the
//! event log is a bounded ring buffer, oldest entries evicted first.
//! Expired counters and idle denial histories are pruned from `track` at
//! most once per sweep period, so memory follows live traffic.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::keys::{Outcome, UsageKey};
use crate::clock::Clock;
use crate::error::TollgateError;

/// Reason attached to security events produced by denials.
pub const RATE_LIMIT_EXCEEDED: &str = "rate_limit_exceeded";

/// Recorder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Denials within the window above which a principal is flagged
    #[serde(default = "default_denial_threshold")]
    pub denial_threshold: usize,

    /// Trailing window for counting denials, in seconds
    #[serde(default = "default_denial_window")]
    pub denial_window_secs: u64,

    /// Maximum number of security events retained
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,

    /// Lifetime of a usage counter before it resets, in seconds
    #[serde(default = "default_counter_ttl")]
    pub counter_ttl_secs: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            denial_threshold: default_denial_threshold(),
            denial_window_secs: default_denial_window(),
            log_capacity: default_log_capacity(),
            counter_ttl_secs: default_counter_ttl(),
        }
    }
}

fn default_denial_threshold() -> usize {
    10
}

fn default_denial_window() -> u64 {
    60
}

fn default_log_capacity() -> usize {
    1000
}

fn default_counter_ttl() -> u64 {
    3600
}

/// Allowed/blocked counts for one `(endpoint, tier, region)`.
#[derive(Debug, Clone, Copy)]
struct UsageCounter {
    allowed: u64,
    blocked: u64,
    expires_at: f64,
}

/// Aggregated counts returned by [`UsageRecorder::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageStats {
    pub allowed: u64,
    pub blocked: u64,
}

/// A denied request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SecurityEvent {
    pub principal: String,
    pub endpoint: String,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

/// Published when a principal is denied too often within the window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuspiciousActivity {
    pub principal: String,
    pub endpoint: String,
    pub denials: usize,
    pub window_secs: u64,
    pub detected_at: DateTime<Utc>,
}

/// Records decision outcomes for introspection and abuse detection.
pub struct UsageRecorder {
    config: SecurityConfig,
    clock: Arc<dyn Clock>,
    counters: DashMap<UsageKey, UsageCounter>,
    /// Denial timestamps per principal, oldest first, within the window
    denials: DashMap<String, VecDeque<f64>>,
    events: Mutex<VecDeque<SecurityEvent>>,
    alerts: broadcast::Sender<SuspiciousActivity>,
    errors: AtomicU64,
    /// Clock reading (as f64 bits) at which the next sweep is due
    next_sweep_at: AtomicU64,
}

impl UsageRecorder {
    pub fn new(config: SecurityConfig, clock: Arc<dyn Clock>) -> Self {
        let (alerts, _) = broadcast::channel(64);
        Self {
            events: Mutex::new(VecDeque::with_capacity(config.log_capacity.min(1024))),
            config,
            clock,
            counters: DashMap::new(),
            denials: DashMap::new(),
            alerts,
            errors: AtomicU64::new(0),
            next_sweep_at: AtomicU64::new(0.0_f64.to_bits()),
        }
    }

    /// Record one decision.
    ///
    /// Denials are also appended to the security log and may raise a
    /// [`SuspiciousActivity`] alert.
    pub fn track(&self, principal: &str, endpoint: &str, tier: &str, region: &str, allowed: bool) {
        let now = self.clock.now();
        self.sweep_if_due(now);

        let key = UsageKey::new(endpoint, tier, region);
        let outcome = if allowed { Outcome::Allowed } else { Outcome::Blocked };

        {
            let ttl = self.config.counter_ttl_secs as f64;
            let mut counter = self.counters.entry(key.clone()).or_insert(UsageCounter {
                allowed: 0,
                blocked: 0,
                expires_at: now + ttl,
            });
            if counter.expires_at <= now {
                *counter = UsageCounter {
                    allowed: 0,
                    blocked: 0,
                    expires_at: now + ttl,
                };
            }
            match outcome {
                Outcome::Allowed => counter.allowed += 1,
                Outcome::Blocked => counter.blocked += 1,
            }
        }

        if allowed {
            return;
        }

        debug!(
            principal = %principal,
            counter = %key.counter_name(outcome),
            "Recording denial"
        );
        self.record_denial(principal, endpoint, now);
    }

    fn record_denial(&self, principal: &str, endpoint: &str, now: f64) {
        let timestamp = to_datetime(now);

        {
            let mut events = self.events.lock();
            while !events.is_empty() && events.len() >= self.config.log_capacity {
                events.pop_front();
            }
            if self.config.log_capacity > 0 {
                events.push_back(SecurityEvent {
                    principal: principal.to_string(),
                    endpoint: endpoint.to_string(),
                    timestamp,
                    reason: RATE_LIMIT_EXCEEDED.to_string(),
                });
            }
        }

        let cutoff = self.window_start(now);
        let recent = {
            let mut history = self.denials.entry(principal.to_string()).or_default();
            while history.front().is_some_and(|&at| at < cutoff) {
                history.pop_front();
            }
            history.push_back(now);
            // Past the threshold only the crossing matters.
            while history.len() > self.config.denial_threshold.saturating_add(1) {
                history.pop_front();
            }
            history.len()
        };

        if recent > self.config.denial_threshold {
            warn!(
                principal = %principal,
                endpoint = %endpoint,
                denials = recent,
                window_secs = self.config.denial_window_secs,
                "Suspicious activity: repeated rate limit denials"
            );
            // No subscribers is fine; the log line above still records it.
            let _ = self.alerts.send(SuspiciousActivity {
                principal: principal.to_string(),
                endpoint: endpoint.to_string(),
                denials: recent,
                window_secs: self.config.denial_window_secs,
                detected_at: timestamp,
            });
        }
    }

    /// Oldest denial time still inside the trailing window ending at `now`.
    fn window_start(&self, now: f64) -> f64 {
        now - self.config.denial_window_secs as f64
    }

    fn sweep_period(&self) -> f64 {
        self.config
            .counter_ttl_secs
            .min(self.config.denial_window_secs)
            .max(1) as f64
    }

    /// Sweep when the period has elapsed; concurrent callers race on the
    /// deadline and only the winner sweeps.
    fn sweep_if_due(&self, now: f64) {
        let due_bits = self.next_sweep_at.load(Ordering::Acquire);
        if now < f64::from_bits(due_bits) {
            return;
        }
        let next = now + self.sweep_period();
        if self
            .next_sweep_at
            .compare_exchange(due_bits, next.to_bits(), Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.sweep_expired(now);
        }
    }

    /// Drop expired usage counters and principals with no denial inside the
    /// window. Returns the number of entries removed.
    pub fn sweep_expired(&self, now: f64) -> usize {
        let before = self.counters.len() + self.denials.len();
        let cutoff = self.window_start(now);

        self.counters.retain(|_, counter| counter.expires_at > now);
        self.denials
            .retain(|_, history| history.back().is_some_and(|&at| at >= cutoff));

        let removed = before.saturating_sub(self.counters.len() + self.denials.len());
        if removed > 0 {
            debug!(removed = removed, "Swept expired usage state");
        }
        removed
    }

    /// Number of live usage counters.
    pub fn counter_len(&self) -> usize {
        self.counters.len()
    }

    /// Number of principals with a tracked denial history.
    pub fn denial_history_len(&self) -> usize {
        self.denials.len()
    }

    /// Report a fault that was absorbed by failing open.
    pub fn record_error(&self, context: &str, error: &TollgateError) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        warn!(context = %context, error = %error, "Rate limit check failed open");
    }

    /// Number of faults reported through [`record_error`](Self::record_error).
    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Subscribe to suspicious-activity alerts.
    pub fn subscribe(&self) -> broadcast::Receiver<SuspiciousActivity> {
        self.alerts.subscribe()
    }

    /// Sum the live counters matching the filter; `None` matches anything.
    pub fn stats(
        &self,
        endpoint: Option<&str>,
        tier: Option<&str>,
        region: Option<&str>,
    ) -> UsageStats {
        let now = self.clock.now();
        self.counters
            .iter()
            .filter(|entry| entry.value().expires_at > now)
            .filter(|entry| entry.key().matches(endpoint, tier, region))
            .fold(UsageStats::default(), |mut stats, entry| {
                stats.allowed += entry.value().allowed;
                stats.blocked += entry.value().blocked;
                stats
            })
    }

    /// The most recent `limit` security events, newest last.
    pub fn security_log(&self, limit: usize) -> Vec<SecurityEvent> {
        let events = self.events.lock();
        let skip = events.len().saturating_sub(limit);
        events.iter().skip(skip).cloned().collect()
    }
}

fn to_datetime(secs: f64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis((secs * 1000.0) as i64).unwrap_or_default()
}
