use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::ratelimit::Quota;

/// Internal authentication failure detail. Externally every variant maps to
/// the same 401 body so callers cannot enumerate which check failed.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("malformed credential")]
    Malformed,
    #[error("unknown credential")]
    Unknown,
    #[error("token is inactive")]
    Inactive,
    #[error("token is expired")]
    Expired,
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("operation not permitted")]
    Forbidden,

    #[error("rate limit exceeded")]
    RateLimited(Quota),

    #[error("rate limiter backend unavailable")]
    RateLimiterUnavailable,

    #[error("job not found")]
    JobNotFound,

    #[error("token not found")]
    TokenNotFound,

    #[error("{0}")]
    Conflict(String),

    /// A guarded state update failed to apply. This signals a dispatcher
    /// bug, not a user error; the job row itself is untouched.
    #[error("invalid job transition: {job_id} {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: String,
        to: String,
    },

    #[error("{0}")]
    BadRequest(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, code, msg) = match &self {
            AppError::Auth(detail) => {
                // Distinct internally for the log, uniform externally.
                tracing::debug!(detail = %detail, "authentication rejected");
                (
                    StatusCode::UNAUTHORIZED,
                    "authentication_error",
                    "invalid_token",
                    "invalid or missing token".to_string(),
                )
            }
            AppError::Forbidden => (
                StatusCode::FORBIDDEN,
                "permission_error",
                "forbidden",
                "operation not permitted".to_string(),
            ),
            AppError::RateLimited(_) => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limit_error",
                "rate_limit_exceeded",
                "rate limit exceeded, retry later".to_string(),
            ),
            AppError::RateLimiterUnavailable => {
                tracing::warn!("rate limiter backend unavailable, failing closed");
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    "rate_limit_error",
                    "rate_limiter_unavailable",
                    "service degraded, retry later".to_string(),
                )
            }
            AppError::JobNotFound => (
                StatusCode::NOT_FOUND,
                "invalid_request_error",
                "job_not_found",
                "job not found".to_string(),
            ),
            AppError::TokenNotFound => (
                StatusCode::NOT_FOUND,
                "invalid_request_error",
                "token_not_found",
                "token not found".to_string(),
            ),
            AppError::Conflict(m) => (
                StatusCode::CONFLICT,
                "invalid_request_error",
                "invalid_job_state",
                m.clone(),
            ),
            AppError::InvalidTransition { job_id, from, to } => {
                tracing::error!(
                    job_id = %job_id,
                    from = %from,
                    to = %to,
                    "invalid job transition attempted"
                );
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
            AppError::BadRequest(m) => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "bad_request",
                m.clone(),
            ),
            AppError::Database(e) => {
                tracing::error!("database error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
            AppError::Redis(e) => {
                tracing::error!("redis error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("internal error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": msg,
                "type": error_type,
                "code": code,
            }
        }));

        let mut response = (status, body).into_response();

        match &self {
            AppError::RateLimited(quota) => {
                let headers = response.headers_mut();
                headers.insert("retry-after", HeaderValue::from_static("60"));
                if let Ok(v) = HeaderValue::from_str(&quota.limit.to_string()) {
                    headers.insert("x-ratelimit-limit", v);
                }
                if let Ok(v) = HeaderValue::from_str(&quota.remaining.to_string()) {
                    headers.insert("x-ratelimit-remaining", v);
                }
                if let Ok(v) = HeaderValue::from_str(&quota.reset_epoch.to_string()) {
                    headers.insert("x-ratelimit-reset", v);
                }
            }
            AppError::RateLimiterUnavailable => {
                response
                    .headers_mut()
                    .insert("retry-after", HeaderValue::from_static("60"));
            }
            _ => {}
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: AppError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn test_auth_failures_are_uniform_401() {
        for detail in [
            AuthError::Malformed,
            AuthError::Unknown,
            AuthError::Inactive,
            AuthError::Expired,
        ] {
            assert_eq!(status_of(AppError::Auth(detail)), StatusCode::UNAUTHORIZED);
        }
    }

    #[test]
    fn test_rate_limit_denial_carries_quota_headers() {
        let resp = AppError::RateLimited(Quota {
            limit: 100,
            remaining: 0,
            reset_epoch: 1_700_000_060,
        })
        .into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers()["x-ratelimit-limit"], "100");
        assert_eq!(resp.headers()["x-ratelimit-remaining"], "0");
        assert_eq!(resp.headers()["x-ratelimit-reset"], "1700000060");
        assert_eq!(resp.headers()["retry-after"], "60");
    }

    #[test]
    fn test_backend_unavailable_is_throttling_class_with_distinct_code() {
        let resp = AppError::RateLimiterUnavailable.into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers()["retry-after"], "60");
    }

    #[test]
    fn test_invalid_transition_is_opaque_500() {
        let err = AppError::InvalidTransition {
            job_id: "aB3xK9mN2p".into(),
            from: "QUEUED".into(),
            to: "COMPLETE".into(),
        };
        assert_eq!(status_of(err), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_forbidden_has_minimal_detail() {
        assert_eq!(status_of(AppError::Forbidden), StatusCode::FORBIDDEN);
    }
}
