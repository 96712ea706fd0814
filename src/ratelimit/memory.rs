//! In-process fixed-window limiter.
//!
//! Counters live in this process only, so two service instances would each
//! admit a full ceiling. Development and tests only; `config::load`
//! refuses this backend in production.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use super::{current_window, Quota, RateDecision, RateLimiter};

#[derive(Debug)]
struct WindowCounter {
    window: u64,
    count: u64,
}

#[derive(Default)]
pub struct MemoryRateLimiter {
    counters: DashMap<String, WindowCounter>,
}

impl MemoryRateLimiter {
    pub fn new() -> Self {
        tracing::warn!("using in-memory rate limiter: single-instance development mode only");
        Self::default()
    }

    fn increment(&self, key: &str, window: u64) -> u64 {
        // The entry API holds the shard lock for the whole read-modify-write,
        // which makes the increment atomic per key within this process.
        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert(WindowCounter { window, count: 0 });
        if entry.window != window {
            entry.window = window;
            entry.count = 0;
        }
        entry.count += 1;
        entry.count
    }

    fn allow_at(&self, key: &str, limit: u32, window: u64, reset_epoch: u64) -> RateDecision {
        let count = self.increment(key, window);
        let quota = Quota::from_count(limit, count, reset_epoch);
        if count <= u64::from(limit) {
            RateDecision::Allowed(quota)
        } else {
            RateDecision::Denied(quota)
        }
    }
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn allow(&self, key: &str, limit: u32) -> RateDecision {
        let now = Utc::now().timestamp().max(0) as u64;
        let (window, reset_epoch) = current_window(now);
        self.allow_at(key, limit, window, reset_epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_denies_past_ceiling_within_window() {
        let limiter = MemoryRateLimiter::default();
        for i in 0..5u32 {
            match limiter.allow_at("rate:t1", 5, 100, 6060) {
                RateDecision::Allowed(q) => assert_eq!(q.remaining, 4 - i),
                other => panic!("request {i} should be allowed, got {other:?}"),
            }
        }
        match limiter.allow_at("rate:t1", 5, 100, 6060) {
            RateDecision::Denied(q) => {
                assert_eq!(q.limit, 5);
                assert_eq!(q.remaining, 0);
                assert_eq!(q.reset_epoch, 6060);
            }
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = MemoryRateLimiter::default();
        assert!(matches!(
            limiter.allow_at("rate:a", 1, 100, 6060),
            RateDecision::Allowed(_)
        ));
        assert!(matches!(
            limiter.allow_at("rate:a", 1, 100, 6060),
            RateDecision::Denied(_)
        ));
        assert!(matches!(
            limiter.allow_at("rate:b", 1, 100, 6060),
            RateDecision::Allowed(_)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_requests_admit_exactly_the_ceiling() {
        let limiter = Arc::new(MemoryRateLimiter::default());
        let ceiling = 50u32;
        let attempts = 200;

        let mut handles = Vec::with_capacity(attempts);
        for _ in 0..attempts {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                // Fixed window so a minute boundary mid-test cannot skew the count.
                limiter.allow_at("rate:concurrent", ceiling, 100, 6060)
            }));
        }

        let mut allowed = 0;
        let mut denied = 0;
        for handle in handles {
            match handle.await.unwrap() {
                RateDecision::Allowed(_) => allowed += 1,
                RateDecision::Denied(_) => denied += 1,
                RateDecision::Unavailable => panic!("memory backend is never unavailable"),
            }
        }
        assert_eq!(allowed, ceiling as usize);
        assert_eq!(denied, attempts - ceiling as usize);
    }

    #[test]
    fn test_window_rollover_resets_count() {
        let limiter = MemoryRateLimiter::default();
        assert!(matches!(
            limiter.allow_at("rate:r", 1, 100, 6060),
            RateDecision::Allowed(_)
        ));
        assert!(matches!(
            limiter.allow_at("rate:r", 1, 100, 6060),
            RateDecision::Denied(_)
        ));
        // Next minute: a fresh window admits again.
        assert!(matches!(
            limiter.allow_at("rate:r", 1, 101, 6120),
            RateDecision::Allowed(_)
        ));
    }
}
