//! Per-user token-bucket rate gate for publish (10/min/user, §4.4/§4.8).
//!
//! Grounded on the teacher's hand-rolled `RateLimiter`/`TokenBucket` in
//! `citadel-api/src/main.rs`, re-keyed from `IpAddr` to [`UserId`]. No
//! external rate-limit crate appears anywhere in the retrieval pack
//! (`governor`/`tower_governor`/`leaky_bucket` are all absent from every
//! `other_examples/manifests/*/Cargo.toml`), so this stays hand-rolled.

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::Mutex;

use crate::types::UserId;

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

/// A token-bucket rate limiter keyed by an arbitrary string identity.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, TokenBucket>>,
    rate_per_sec: f64,
    burst: f64,
}

impl RateLimiter {
    /// `rate_per_minute` tokens refill per minute, up to `burst` banked.
    pub fn per_minute(rate_per_minute: f64, burst: f64) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            rate_per_sec: rate_per_minute / 60.0,
            burst,
        }
    }

    async fn check(&self, key: &str) -> bool {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        let bucket = buckets.entry(key.to_string()).or_insert(TokenBucket { tokens: self.burst, last_refill: now });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_sec).min(self.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub async fn check_user(&self, user_id: &UserId) -> bool {
        self.check(user_id.as_str()).await
    }

    /// Drop buckets that have not been touched recently, bounding memory
    /// for a long-lived process with a long tail of one-shot users.
    pub async fn sweep_idle(&self, idle_for_secs: u64) {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        buckets.retain(|_, bucket| now.duration_since(bucket.last_refill).as_secs() < idle_for_secs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_burst_then_throttles() {
        let limiter = RateLimiter::per_minute(10.0, 10.0);
        let user = UserId::new("user-1");
        for _ in 0..10 {
            assert!(limiter.check_user(&user).await);
        }
        assert!(!limiter.check_user(&user).await);
    }

    #[tokio::test]
    async fn buckets_are_independent_per_user() {
        let limiter = RateLimiter::per_minute(1.0, 1.0);
        let a = UserId::new("user-a");
        let b = UserId::new("user-b");
        assert!(limiter.check_user(&a).await);
        assert!(!limiter.check_user(&a).await);
        assert!(limiter.check_user(&b).await);
    }
}
