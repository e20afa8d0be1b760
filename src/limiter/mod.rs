use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::storage::Store;

/// Token bucket state for one rate-limit key.
///
/// Keys follow `user:{id}:agent:{tool}` for per-caller budgets and
/// `global:agent:{tool}` for shared ones. Buckets are created lazily,
/// full, and never deleted except by an explicit reset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitBucket {
    pub key: String,
    pub tokens: f64,
    pub capacity: f64,
    pub refill_rate_per_s: f64,
    pub last_refill_at: DateTime<Utc>,
}

impl RateLimitBucket {
    /// A full bucket as of `now`.
    pub fn full(key: &str, config: RateLimitConfig, now: DateTime<Utc>) -> Self {
        Self {
            key: key.to_string(),
            tokens: config.capacity,
            capacity: config.capacity,
            refill_rate_per_s: config.refill_rate_per_s,
            last_refill_at: now,
        }
    }

    /// Apply the elapsed-time refill: `tokens = min(capacity, tokens + elapsed × rate)`.
    fn refill(&mut self, now: DateTime<Utc>) {
        let elapsed = (now - self.last_refill_at)
            .num_milliseconds()
            .max(0) as f64
            / 1000.0;
        self.tokens = (self.tokens + elapsed * self.refill_rate_per_s).min(self.capacity);
        self.last_refill_at = now;
    }
}

/// Bucket sizing for one key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    pub capacity: f64,
    pub refill_rate_per_s: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 100.0,
            refill_rate_per_s: 10.0,
        }
    }
}

impl RateLimitConfig {
    /// Budget expressed as calls per minute — the usual shape for
    /// LLM-backed tools (2–8/min).
    pub fn per_minute(calls: f64) -> Self {
        Self {
            capacity: calls,
            refill_rate_per_s: calls / 60.0,
        }
    }
}

/// Read-only bucket snapshot for introspection endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct BucketStatus {
    pub key: String,
    pub tokens: f64,
    pub capacity: f64,
    pub refill_rate_per_s: f64,
}

/// Per-key token-bucket admission control.
///
/// Every mutation is a read-modify-write under that key's own async lock —
/// single writer per key, no lock shared across keys. Bucket state lives
/// in the injected store so admissions survive restarts.
pub struct RateLimiter {
    store: Arc<dyn Store>,
    locks: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Try to take `tokens_required` tokens from the bucket at `key`.
    ///
    /// Returns `true` when admitted. On denial the refilled-but-unconsumed
    /// state is still persisted, so `last_refill_at` keeps moving forward.
    pub async fn admit(
        &self,
        key: &str,
        tokens_required: f64,
        config: RateLimitConfig,
    ) -> Result<bool> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let mut bucket = match self.store.get_bucket(key).await? {
            Some(b) => b,
            None => RateLimitBucket::full(key, config, now),
        };

        bucket.refill(now);

        let admitted = bucket.tokens >= tokens_required;
        if admitted {
            bucket.tokens -= tokens_required;
        }
        self.store.put_bucket(&bucket).await?;

        if !admitted {
            debug!(key = %key, tokens = bucket.tokens, required = tokens_required, "Rate limit denial");
        }

        Ok(admitted)
    }

    /// Current bucket state with the refill formula applied, without
    /// consuming tokens or persisting anything.
    pub async fn status(&self, key: &str, config: RateLimitConfig) -> Result<BucketStatus> {
        let now = Utc::now();
        let mut bucket = match self.store.get_bucket(key).await? {
            Some(b) => b,
            None => RateLimitBucket::full(key, config, now),
        };
        bucket.refill(now);

        Ok(BucketStatus {
            key: bucket.key,
            tokens: bucket.tokens,
            capacity: bucket.capacity,
            refill_rate_per_s: bucket.refill_rate_per_s,
        })
    }

    /// Restore a full bucket at `key`.
    pub async fn reset(&self, key: &str, config: RateLimitConfig) -> Result<()> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        let bucket = RateLimitBucket::full(key, config, Utc::now());
        self.store.put_bucket(&bucket).await
    }
}
