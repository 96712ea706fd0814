//! Distributed request rate limiting.
//!
//! Fixed 60-second windows keyed by `(token, window)`. The increment must
//! be atomic per key: two concurrent requests at the ceiling must never
//! both observe "under limit". The Redis backend is the only one safe for
//! multi-instance deployments; the in-memory backend exists for
//! development and tests and is refused by `config` in production.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::auth::Identity;
use crate::errors::AppError;

pub mod memory;
pub mod redis;

pub const WINDOW_SECS: u64 = 60;

/// Rate limit metadata, derivable on every decision (including denials)
/// for the `x-ratelimit-*` response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub limit: u32,
    pub remaining: u32,
    pub reset_epoch: u64,
}

impl Quota {
    pub fn from_count(limit: u32, count: u64, reset_epoch: u64) -> Self {
        Quota {
            limit,
            remaining: limit.saturating_sub(count.min(u64::from(u32::MAX)) as u32),
            reset_epoch,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed(Quota),
    Denied(Quota),
    /// Counter backend unreachable; policy decided by the gate.
    Unavailable,
}

/// Backend-failure policy, read once at process start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailMode {
    #[default]
    Closed,
    Open,
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Count one request against `key` and decide within the current
    /// window. `limit` is the per-identity requests-per-minute ceiling.
    async fn allow(&self, key: &str, limit: u32) -> RateDecision;
}

/// Current window bucket and the epoch second at which it resets.
pub fn current_window(now_epoch: u64) -> (u64, u64) {
    let window = now_epoch / WINDOW_SECS;
    (window, (window + 1) * WINDOW_SECS)
}

/// The limiter plus the process-wide failure policy.
#[derive(Clone)]
pub struct RateLimitGate {
    limiter: Arc<dyn RateLimiter>,
    fail_mode: FailMode,
}

impl RateLimitGate {
    pub fn new(limiter: Arc<dyn RateLimiter>, fail_mode: FailMode) -> Self {
        Self { limiter, fail_mode }
    }

    /// Admit or reject a request for `identity`. Returns the quota for
    /// response headers on admission.
    pub async fn check(&self, identity: &Identity) -> Result<Quota, AppError> {
        let key = format!("rate:{}", identity.token_id);
        let limit = identity.rate_limit.max(0) as u32;

        match self.limiter.allow(&key, limit).await {
            RateDecision::Allowed(quota) => Ok(quota),
            RateDecision::Denied(quota) => {
                tracing::info!(
                    token_id = %identity.token_id,
                    limit = quota.limit,
                    "rate limit exceeded"
                );
                Err(AppError::RateLimited(quota))
            }
            RateDecision::Unavailable => match self.fail_mode {
                FailMode::Closed => Err(AppError::RateLimiterUnavailable),
                FailMode::Open => {
                    tracing::warn!(
                        token_id = %identity.token_id,
                        "rate limiter backend unavailable, admitting (fail-open)"
                    );
                    let now = Utc::now().timestamp().max(0) as u64;
                    let (_, reset) = current_window(now);
                    Ok(Quota {
                        limit,
                        remaining: limit,
                        reset_epoch: reset,
                    })
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use uuid::Uuid;

    struct DownBackend;

    #[async_trait]
    impl RateLimiter for DownBackend {
        async fn allow(&self, _key: &str, _limit: u32) -> RateDecision {
            RateDecision::Unavailable
        }
    }

    fn identity() -> Identity {
        Identity {
            token_id: Uuid::new_v4(),
            user_id: "alice".into(),
            role: Role::JobWriter,
            rate_limit: 100,
        }
    }

    #[test]
    fn test_window_math() {
        let (window, reset) = current_window(1_700_000_123);
        assert_eq!(window, 1_700_000_123 / 60);
        assert_eq!(reset, (window + 1) * 60);
        assert!(reset > 1_700_000_123);
        assert!(reset - 1_700_000_123 <= 60);
    }

    #[test]
    fn test_quota_from_count_saturates() {
        let q = Quota::from_count(10, 3, 600);
        assert_eq!(q.remaining, 7);
        let q = Quota::from_count(10, 10, 600);
        assert_eq!(q.remaining, 0);
        let q = Quota::from_count(10, 25, 600);
        assert_eq!(q.remaining, 0);
    }

    #[tokio::test]
    async fn test_fail_closed_denies_everything_with_degraded_signal() {
        let gate = RateLimitGate::new(Arc::new(DownBackend), FailMode::Closed);
        let id = identity();
        for _ in 0..20 {
            match gate.check(&id).await {
                Err(AppError::RateLimiterUnavailable) => {}
                other => panic!("expected RateLimiterUnavailable, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_fail_open_admits_everything() {
        let gate = RateLimitGate::new(Arc::new(DownBackend), FailMode::Open);
        let id = identity();
        for _ in 0..20 {
            let quota = gate.check(&id).await.expect("fail-open must admit");
            assert_eq!(quota.limit, 100);
        }
    }

    #[tokio::test]
    async fn test_closed_is_the_default_mode() {
        assert_eq!(FailMode::default(), FailMode::Closed);
    }
}
