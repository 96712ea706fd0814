//! HTTP surface: health probes, the conversion/job API and the admin
//! token API. Everything under `/api/v1` sits behind the bearer-token
//! middleware in [`auth_layer`].

pub mod admin;
pub mod auth_layer;
pub mod handlers;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::{middleware, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    let max_body = state.config.max_upload_mb * 1024 * 1024;

    let authed = Router::new()
        .route("/api/v1/convert", post(handlers::convert))
        .route("/api/v1/jobs", get(handlers::list_jobs))
        .route("/api/v1/jobs/:job_id", get(handlers::get_job))
        .route("/api/v1/jobs/:job_id/result", get(handlers::get_result))
        .route("/api/v1/jobs/:job_id/cancel", post(handlers::cancel_job))
        .route("/api/v1/jobs/:job_id/stop", post(handlers::stop_job))
        .route("/api/v1/jobs/:job_id/throttle", post(handlers::throttle_job))
        .route(
            "/api/v1/jobs/:job_id/grant-access",
            post(handlers::grant_access),
        )
        .route(
            "/api/v1/admin/tokens",
            post(admin::create_token).get(admin::list_tokens),
        )
        .route(
            "/api/v1/admin/tokens/:token_id",
            axum::routing::delete(admin::revoke_token).patch(admin::modify_token),
        )
        .route(
            "/api/v1/admin/tokens/:token_id/usage",
            get(admin::token_usage),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_layer::authenticate,
        ));

    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .merge(authed)
        .layer(DefaultBodyLimit::max(max_body))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
