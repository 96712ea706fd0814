//! Bearer-token middleware: authenticate, rate limit, attach identity,
//! record usage.
//!
//! Order matters: the credential is resolved first so the rate limit is
//! keyed by token identity, not by caller IP. Every authenticated call is
//! audited, including denied ones; anonymous failures have no token to
//! attribute and are only logged.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;

use crate::auth::Identity;
use crate::errors::{AppError, AuthError};
use crate::ratelimit::Quota;
use crate::store::postgres::TokenUsage;
use crate::{audit, AppState};

pub async fn authenticate(
    State(state): State<Arc<AppState>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let started = Instant::now();
    let endpoint = req.uri().path().to_string();
    let method = req.method().to_string();
    let request_bytes = req
        .headers()
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok());

    let bearer = match bearer_token(&req) {
        Some(b) => b,
        None => return AppError::from(AuthError::Malformed).into_response(),
    };

    let identity = match state.authenticator.authenticate(&bearer, Utc::now()).await {
        Ok(identity) => identity,
        Err(e) => return e.into_response(),
    };

    let quota = match state.gate.check(&identity).await {
        Ok(quota) => quota,
        Err(e) => {
            let response = e.into_response();
            record(&state, &identity, &endpoint, &method, request_bytes, started, &response);
            return response;
        }
    };

    req.extensions_mut().insert(identity.clone());
    let mut response = next.run(req).await;
    apply_quota_headers(&mut response, &quota);
    record(&state, &identity, &endpoint, &method, request_bytes, started, &response);
    response
}

fn bearer_token(req: &Request<Body>) -> Option<String> {
    let header = req.headers().get(AUTHORIZATION)?.to_str().ok()?;
    header
        .strip_prefix("Bearer ")
        .map(|t| t.trim().to_string())
}

fn apply_quota_headers(response: &mut Response, quota: &Quota) {
    let headers = response.headers_mut();
    if let Ok(v) = quota.limit.to_string().parse() {
        headers.insert("x-ratelimit-limit", v);
    }
    if let Ok(v) = quota.remaining.to_string().parse() {
        headers.insert("x-ratelimit-remaining", v);
    }
    if let Ok(v) = quota.reset_epoch.to_string().parse() {
        headers.insert("x-ratelimit-reset", v);
    }
}

fn record(
    state: &AppState,
    identity: &Identity,
    endpoint: &str,
    method: &str,
    request_bytes: Option<i64>,
    started: Instant,
    response: &Response,
) {
    audit::log_async(
        state.db.clone(),
        TokenUsage {
            token_id: identity.token_id,
            ts: Utc::now(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
            request_bytes,
            latency_ms: i32::try_from(started.elapsed().as_millis()).ok(),
            status: response.status().as_u16() as i16,
        },
    );
}
