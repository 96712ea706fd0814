//! pdf2md — authenticated PDF-to-markdown conversion service.
//!
//! Control plane: bearer-token authentication, role-based authorization
//! with per-job grants, distributed per-token rate limiting, a guarded job
//! state machine and a sandboxed extraction dispatcher.

pub mod api;
pub mod audit;
pub mod auth;
pub mod cli;
pub mod config;
pub mod errors;
pub mod jobs;
pub mod ratelimit;
pub mod sandbox;
pub mod store;

use auth::{Authenticator, Authorizer};
use jobs::worker::WorkerControl;
use jobs::JobRegistry;
use ratelimit::RateLimitGate;
use store::blob::BlobStore;
use store::postgres::PgStore;

/// Shared application state passed to handlers and middleware.
pub struct AppState {
    pub db: PgStore,
    pub registry: JobRegistry,
    pub authenticator: Authenticator,
    pub authz: Authorizer,
    pub gate: RateLimitGate,
    pub blob: BlobStore,
    pub worker_ctl: WorkerControl,
    /// Present only with the Redis rate-limit backend; readiness skips the
    /// ping otherwise.
    pub redis: Option<redis::aio::ConnectionManager>,
    pub config: config::Config,
}

impl AppState {
    pub async fn redis_ping(&self) -> bool {
        match &self.redis {
            Some(conn) => {
                let mut conn = conn.clone();
                redis::cmd("PING")
                    .query_async::<_, String>(&mut conn)
                    .await
                    .is_ok()
            }
            None => true,
        }
    }
}
