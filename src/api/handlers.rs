//! Conversion and job control handlers.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::auth::{list_scope, Identity, Operation};
use crate::errors::AppError;
use crate::jobs::model::{Job, JobStatus};
use crate::jobs::id::is_valid_job_id;
use crate::store::blob::BlobStore;
use crate::AppState;

const PDF_MAGIC: &[u8] = b"%PDF-";

const VALID_OUTPUT_FORMATS: [&str; 4] = ["markdown", "json", "yaml", "text"];
const VALID_EXTRACTORS: [&str; 2] = ["pdfplumber", "pymupdf"];

// ── Request / Response DTOs ──────────────────────────────────

#[derive(Deserialize)]
pub struct ConvertQuery {
    pub output_format: Option<String>,
    pub extractor: Option<String>,
}

#[derive(Serialize)]
pub struct ConvertResponse {
    pub job_id: String,
    pub status: JobStatus,
}

#[derive(Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<Job>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Deserialize)]
pub struct ThrottleRequest {
    pub throttled: bool,
}

#[derive(Deserialize)]
pub struct GrantRequest {
    pub user_id: String,
}

// ── Health ───────────────────────────────────────────────────

pub async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Readiness: both backing stores answer, or the instance should not
/// receive traffic.
pub async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let db_ok = state.db.ping().await.is_ok();
    let redis_ok = state.redis_ping().await;

    let status = if db_ok && redis_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({ "database": db_ok, "redis": redis_ok })),
    )
}

// ── Conversion ───────────────────────────────────────────────

/// POST /api/v1/convert — raw PDF body in, QUEUED job out.
pub async fn convert(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<ConvertQuery>,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    state
        .authz
        .require(&identity, Operation::CreateJob, None)
        .await?;

    if body.is_empty() {
        return Err(AppError::BadRequest("empty request body".into()));
    }
    if !body.starts_with(PDF_MAGIC) {
        return Err(AppError::BadRequest(
            "request body is not a PDF document".into(),
        ));
    }

    let options = convert_options(&query)?;

    // Bytes first, row second: the instant a QUEUED row commits, any worker
    // instance may claim it, so its input must already be in place.
    let input_ref = BlobStore::new_input_ref();
    state
        .blob
        .put(&input_ref, body)
        .await
        .map_err(AppError::Internal)?;

    let job = match state
        .registry
        .create(&identity.user_id, options, &input_ref)
        .await
    {
        Ok(job) => job,
        Err(e) => {
            tracing::warn!(input_ref = %input_ref, "job insert failed, upload left orphaned");
            return Err(e);
        }
    };

    Ok((
        StatusCode::ACCEPTED,
        Json(ConvertResponse {
            job_id: job.job_id,
            status: job.status,
        }),
    ))
}

// ── Job queries ──────────────────────────────────────────────

pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<JobListResponse>, AppError> {
    let status = match query.status.as_deref() {
        Some(s) => Some(
            JobStatus::parse(s)
                .ok_or_else(|| AppError::BadRequest(format!("unknown job status '{s}'")))?,
        ),
        None => None,
    };
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let offset = query.offset.unwrap_or(0).max(0);

    let scope = list_scope(&identity);
    let (jobs, total) = state.registry.list(status, &scope, limit, offset).await?;
    Ok(Json(JobListResponse {
        jobs,
        total,
        limit,
        offset,
    }))
}

pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, AppError> {
    let job = fetch_job(&state, &job_id).await?;
    state
        .authz
        .require(&identity, Operation::ViewJob, Some(&job))
        .await?;
    Ok(Json(job))
}

/// GET /api/v1/jobs/:id/result — converted bytes, COMPLETE jobs only.
pub async fn get_result(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let job = fetch_job(&state, &job_id).await?;
    state
        .authz
        .require(&identity, Operation::ViewJob, Some(&job))
        .await?;

    if job.status != JobStatus::Complete {
        return Err(AppError::Conflict(format!(
            "job is {}, result available only for COMPLETE jobs",
            job.status
        )));
    }
    let result_ref = job
        .result_ref
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("COMPLETE job {job_id} has no result reference"))?;

    let bytes = state
        .blob
        .get(result_ref)
        .await
        .map_err(AppError::Internal)?;
    let content_type = if result_ref.ends_with(".json") {
        "application/json"
    } else {
        "text/markdown; charset=utf-8"
    };
    Ok(([(header::CONTENT_TYPE, content_type)], bytes))
}

// ── Job control ──────────────────────────────────────────────

pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, AppError> {
    let job = fetch_job(&state, &job_id).await?;
    state
        .authz
        .require(&identity, Operation::CancelJob, Some(&job))
        .await?;

    match state.registry.cancel(&job_id).await {
        Ok(()) => {}
        // Cancel targets queued work only; anything else is a caller error,
        // not a service fault.
        Err(AppError::InvalidTransition { from, .. }) => {
            return Err(AppError::Conflict(format!(
                "job is {from}, only QUEUED jobs can be cancelled"
            )));
        }
        Err(e) => return Err(e),
    }
    refetch(&state, &job_id).await
}

/// POST /api/v1/jobs/:id/stop — terminate a RUNNING job's worker.
pub async fn stop_job(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, AppError> {
    let job = fetch_job(&state, &job_id).await?;
    state
        .authz
        .require(&identity, Operation::StopJob, Some(&job))
        .await?;

    // Row first, kill second: once STOPPED is committed the worker's own
    // finalize can no longer overwrite it.
    match state.registry.stop(&job_id).await {
        Ok(()) => state.worker_ctl.signal_stop(&job_id),
        Err(AppError::InvalidTransition { from, .. }) => {
            return Err(AppError::Conflict(format!(
                "job is {from}, only RUNNING jobs can be stopped"
            )));
        }
        Err(e) => return Err(e),
    }
    refetch(&state, &job_id).await
}

pub async fn throttle_job(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(job_id): Path<String>,
    Json(body): Json<ThrottleRequest>,
) -> Result<Json<Job>, AppError> {
    let job = fetch_job(&state, &job_id).await?;
    state
        .authz
        .require(&identity, Operation::ThrottleJob, Some(&job))
        .await?;

    state
        .registry
        .throttle(&job_id, body.throttled, &identity.user_id)
        .await?;
    refetch(&state, &job_id).await
}

pub async fn grant_access(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(job_id): Path<String>,
    Json(body): Json<GrantRequest>,
) -> Result<impl IntoResponse, AppError> {
    if body.user_id.trim().is_empty() {
        return Err(AppError::BadRequest("user_id must not be empty".into()));
    }
    let job = fetch_job(&state, &job_id).await?;
    state
        .authz
        .require(&identity, Operation::GrantAccess, Some(&job))
        .await?;

    state
        .registry
        .grant_access(&job_id, &body.user_id, &identity.user_id)
        .await?;
    Ok(Json(json!({
        "job_id": job_id,
        "granted_to": body.user_id,
    })))
}

// ── Helpers ──────────────────────────────────────────────────

/// Validate conversion query parameters against the supported sets; unknown
/// values are a caller error, never forwarded into the options blob.
fn convert_options(query: &ConvertQuery) -> Result<serde_json::Value, AppError> {
    let output_format = query.output_format.as_deref().unwrap_or("markdown");
    if !VALID_OUTPUT_FORMATS.contains(&output_format) {
        return Err(AppError::BadRequest(format!(
            "invalid output format '{}', must be one of: {}",
            output_format,
            VALID_OUTPUT_FORMATS.join(", ")
        )));
    }

    let mut options = serde_json::Map::new();
    options.insert("output_format".into(), json!(output_format));

    if let Some(extractor) = query.extractor.as_deref() {
        if !VALID_EXTRACTORS.contains(&extractor) {
            return Err(AppError::BadRequest(format!(
                "invalid extractor '{}', must be one of: {}",
                extractor,
                VALID_EXTRACTORS.join(", ")
            )));
        }
        options.insert("extractor".into(), json!(extractor));
    }

    Ok(serde_json::Value::Object(options))
}

async fn fetch_job(state: &AppState, job_id: &str) -> Result<Job, AppError> {
    // Malformed ids 404 like absent ones; the id space is not probeable.
    if !is_valid_job_id(job_id) {
        return Err(AppError::JobNotFound);
    }
    state
        .registry
        .get(job_id)
        .await?
        .ok_or(AppError::JobNotFound)
}

async fn refetch(state: &Arc<AppState>, job_id: &str) -> Result<Json<Job>, AppError> {
    Ok(Json(fetch_job(state, job_id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pdf_magic_check() {
        assert!(b"%PDF-1.7 rest".starts_with(PDF_MAGIC));
        assert!(!b"PK\x03\x04zip".starts_with(PDF_MAGIC));
        assert!(!b"%PDF".starts_with(PDF_MAGIC));
    }

    fn query(output_format: Option<&str>, extractor: Option<&str>) -> ConvertQuery {
        ConvertQuery {
            output_format: output_format.map(str::to_string),
            extractor: extractor.map(str::to_string),
        }
    }

    #[test]
    fn test_convert_options_defaults_to_markdown() {
        let options = convert_options(&query(None, None)).unwrap();
        assert_eq!(options["output_format"], "markdown");
        assert!(options.get("extractor").is_none());
    }

    #[test]
    fn test_convert_options_accepts_supported_values() {
        for format in VALID_OUTPUT_FORMATS {
            let options = convert_options(&query(Some(format), None)).unwrap();
            assert_eq!(options["output_format"], format);
        }
        for extractor in VALID_EXTRACTORS {
            let options = convert_options(&query(None, Some(extractor))).unwrap();
            assert_eq!(options["extractor"], extractor);
        }
    }

    #[test]
    fn test_convert_options_rejects_unknown_values() {
        for (format, extractor) in [
            (Some("html"), None),
            (Some("MARKDOWN"), None),
            (None, Some("ghostscript")),
            (None, Some("")),
        ] {
            let err = convert_options(&query(format, extractor)).unwrap_err();
            assert!(matches!(err, AppError::BadRequest(_)), "{format:?} {extractor:?}");
        }
    }
}
