//! Redis-backed fixed-window limiter shared by all service instances.

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;

use super::{current_window, Quota, RateDecision, RateLimiter, WINDOW_SECS};

#[derive(Clone)]
pub struct RedisRateLimiter {
    conn: ConnectionManager,
}

impl RedisRateLimiter {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Atomic INCR + EXPIRE. A plain INCR-then-EXPIRE pair can leak a key
    /// without a TTL if the client dies in between, and a GET-then-SET pair
    /// races; the script does both in one server-side step.
    async fn increment(&self, key: &str, window_secs: u64) -> redis::RedisResult<u64> {
        let mut conn = self.conn.clone();
        let script = redis::Script::new(
            r#"
            local current = redis.call("INCR", KEYS[1])
            if current == 1 then
                redis.call("EXPIRE", KEYS[1], ARGV[1])
            end
            return current
        "#,
        );
        script.key(key).arg(window_secs).invoke_async(&mut conn).await
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn allow(&self, key: &str, limit: u32) -> RateDecision {
        let now = Utc::now().timestamp().max(0) as u64;
        let (window, reset_epoch) = current_window(now);
        let window_key = format!("{key}:{window}");

        let count = match self.increment(&window_key, WINDOW_SECS).await {
            Ok(count) => count,
            Err(e) => {
                tracing::error!(key = %window_key, "rate limit increment failed: {}", e);
                return RateDecision::Unavailable;
            }
        };

        let quota = Quota::from_count(limit, count, reset_epoch);
        if count <= u64::from(limit) {
            RateDecision::Allowed(quota)
        } else {
            RateDecision::Denied(quota)
        }
    }
}
