// Shared counters: quotas, token buckets, concurrency slots
//
// The CounterStore is the only globally shared mutable state in the core.
// Every operation on it is atomic in the backing store (Postgres upsert, or
// a mutex in the in-memory implementation). Quota windows are computed here
// so the store only ever sees keys, values, and TTLs.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, TimeZone, Utc};

use crate::error::Result;

// ============================================================================
// CounterStore - atomic counter backend
// ============================================================================

/// Decision returned by an atomic token-bucket take
#[derive(Debug, Clone, PartialEq)]
pub struct BucketDecision {
    pub allowed: bool,
    /// Whole tokens left after the take (0 when denied)
    pub remaining: u64,
    /// Seconds until a retry can succeed (0 when allowed)
    pub retry_after_seconds: u64,
}

/// Atomic counter backend shared across workers.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Read a counter; None when absent or expired
    async fn get_counter(&self, key: &str) -> Result<Option<i64>>;

    /// Set a counter with an expiry, overwriting any previous value
    async fn set_counter(&self, key: &str, value: i64, ttl: Duration) -> Result<()>;

    /// Atomically increment, (re)arming the expiry; returns the new value
    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64>;

    /// Atomically decrement; returns the new value
    async fn decr(&self, key: &str) -> Result<i64>;

    /// Atomically refill-and-take from a token bucket keyed by `key`.
    ///
    /// The store owns the bucket state (token count + last refill time) so
    /// the operation is a single atomic round trip.
    async fn take_tokens(
        &self,
        key: &str,
        capacity: u64,
        refill_per_second: u64,
        cost: u64,
    ) -> Result<BucketDecision>;
}

// ============================================================================
// TokenBucketRateLimiter - namespaced limiter over a CounterStore
// ============================================================================

/// Outcome of a rate-limit check, with standard response headers
#[derive(Debug, Clone)]
pub struct RateDecision {
    pub allowed: bool,
    pub retry_after_seconds: u64,
    pub limit: u64,
    pub remaining: u64,
}

impl RateDecision {
    /// Standard RateLimit-* headers for 429 responses
    pub fn to_headers(&self) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert(
            "Retry-After".to_string(),
            self.retry_after_seconds.max(1).to_string(),
        );
        headers.insert("RateLimit-Limit".to_string(), self.limit.to_string());
        headers.insert(
            "RateLimit-Remaining".to_string(),
            self.remaining.to_string(),
        );
        headers.insert(
            "RateLimit-Reset".to_string(),
            self.retry_after_seconds.max(1).to_string(),
        );
        headers
    }
}

/// Token-bucket limiter with a key namespace (e.g. "rl:plugin:user").
pub struct TokenBucketRateLimiter<'a> {
    store: &'a dyn CounterStore,
    namespace: &'static str,
}

impl<'a> TokenBucketRateLimiter<'a> {
    pub fn new(store: &'a dyn CounterStore, namespace: &'static str) -> Self {
        Self { store, namespace }
    }

    /// Check and consume `cost` tokens for `key`.
    pub async fn check(
        &self,
        key: &str,
        cost: u64,
        capacity: u64,
        refill_per_second: u64,
    ) -> Result<RateDecision> {
        let bucket_key = format!("{}:{}", self.namespace, key);
        let decision = self
            .store
            .take_tokens(&bucket_key, capacity, refill_per_second, cost)
            .await?;
        Ok(RateDecision {
            allowed: decision.allowed,
            retry_after_seconds: decision.retry_after_seconds,
            limit: capacity,
            remaining: decision.remaining,
        })
    }
}

// ============================================================================
// Quota windows (UTC day / calendar month)
// ============================================================================

/// Seconds until end of the current UTC day (always >= 1)
pub fn seconds_until_end_of_day(now: DateTime<Utc>) -> u64 {
    let end_of_day = Utc
        .with_ymd_and_hms(now.year(), now.month(), now.day(), 23, 59, 59)
        .single()
        .unwrap_or(now);
    (end_of_day - now).num_seconds().max(1) as u64
}

/// Seconds until the first instant of the next UTC month (always >= 1)
pub fn seconds_until_next_month(now: DateTime<Utc>) -> u64 {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    let next_month_start = Utc
        .with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or(now);
    (next_month_start - now).num_seconds().max(1) as u64
}

/// Key for the daily quota counter
pub fn daily_quota_key(bucket: &str) -> String {
    format!("quota:d:{bucket}")
}

/// Key for the monthly quota counter
pub fn monthly_quota_key(bucket: &str) -> String {
    format!("quota:m:{bucket}")
}

/// Key for a provider concurrency counter
pub fn concurrency_key(provider: &str) -> String {
    format!("conc:{provider}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_window_is_positive_and_bounded() {
        let now = Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap();
        let secs = seconds_until_end_of_day(now);
        assert!(secs >= 1);
        assert!(secs <= 86_400);
        assert_eq!(secs, 11 * 3600 + 59 * 60 + 59);
    }

    #[test]
    fn month_window_rolls_over_december() {
        let now = Utc.with_ymd_and_hms(2025, 12, 31, 23, 0, 0).unwrap();
        let secs = seconds_until_next_month(now);
        assert_eq!(secs, 3600);
    }

    #[test]
    fn rate_decision_headers_are_standard() {
        let decision = RateDecision {
            allowed: false,
            retry_after_seconds: 12,
            limit: 60,
            remaining: 0,
        };
        let headers = decision.to_headers();
        assert_eq!(headers["Retry-After"], "12");
        assert_eq!(headers["RateLimit-Limit"], "60");
        assert_eq!(headers["RateLimit-Remaining"], "0");
        assert_eq!(headers["RateLimit-Reset"], "12");
    }
}
