//! Token administration over HTTP.
//!
//! Admin-role tokens cannot be minted here no matter who asks; that path
//! exists only in the CLI, which talks to the database directly. The
//! plaintext credential appears exactly once, in the create response.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::auth::authenticator::{generate_credential, hash_credential};
use crate::auth::{Identity, Operation, Role};
use crate::errors::AppError;
use crate::store::postgres::{NewToken, TokenRow, TokenUsageRow};
use crate::AppState;

#[derive(Deserialize)]
pub struct CreateTokenRequest {
    pub user_id: String,
    pub role: String,
    pub expires_days: Option<i64>,
    pub rate_limit: Option<i32>,
}

#[derive(Serialize)]
pub struct CreateTokenResponse {
    pub token_id: Uuid,
    /// Shown once; only a keyed hash is stored.
    pub token: String,
    pub user_id: String,
    pub role: String,
    pub rate_limit: i32,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Redacted token view; the hash never leaves the store.
#[derive(Serialize)]
pub struct TokenView {
    pub token_id: Uuid,
    pub user_id: String,
    pub role: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub rate_limit: i32,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl From<TokenRow> for TokenView {
    fn from(row: TokenRow) -> Self {
        TokenView {
            token_id: row.token_id,
            user_id: row.user_id,
            role: row.role,
            created_at: row.created_at,
            expires_at: row.expires_at,
            is_active: row.is_active,
            rate_limit: row.rate_limit,
            last_used_at: row.last_used_at,
        }
    }
}

#[derive(Deserialize)]
pub struct ModifyTokenRequest {
    pub is_active: Option<bool>,
    pub rate_limit: Option<i32>,
}

#[derive(Deserialize)]
pub struct UsageQuery {
    pub days: Option<i64>,
}

pub async fn create_token(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<CreateTokenRequest>,
) -> Result<(StatusCode, Json<CreateTokenResponse>), AppError> {
    state
        .authz
        .require(&identity, Operation::CreateToken, None)
        .await?;

    if body.user_id.trim().is_empty() {
        return Err(AppError::BadRequest("user_id must not be empty".into()));
    }
    let role = Role::parse(&body.role)
        .ok_or_else(|| AppError::BadRequest(format!("unknown role '{}'", body.role)))?;
    if role == Role::Admin {
        tracing::warn!(
            user = %identity.user_id,
            "admin token creation attempted over HTTP"
        );
        return Err(AppError::Forbidden);
    }
    let rate_limit = body.rate_limit.unwrap_or_else(|| role.default_rate_limit());
    if rate_limit <= 0 {
        return Err(AppError::BadRequest("rate_limit must be positive".into()));
    }

    let credential = generate_credential();
    let token = NewToken {
        token_id: Uuid::new_v4(),
        token_hash: hash_credential(&state.config.token_pepper, &credential),
        user_id: body.user_id.trim().to_string(),
        role: role.as_str().to_string(),
        expires_at: body.expires_days.map(|d| Utc::now() + Duration::days(d)),
        rate_limit,
        created_by: Some(identity.token_id),
    };
    state.db.insert_token(&token).await?;
    tracing::info!(
        token_id = %token.token_id,
        user = %token.user_id,
        role = %token.role,
        by = %identity.user_id,
        "token created"
    );

    Ok((
        StatusCode::CREATED,
        Json(CreateTokenResponse {
            token_id: token.token_id,
            token: credential,
            user_id: token.user_id,
            role: token.role,
            rate_limit: token.rate_limit,
            expires_at: token.expires_at,
        }),
    ))
}

pub async fn list_tokens(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<Vec<TokenView>>, AppError> {
    state
        .authz
        .require(&identity, Operation::ListTokens, None)
        .await?;
    let tokens = state.db.list_tokens().await?;
    Ok(Json(tokens.into_iter().map(TokenView::from).collect()))
}

/// DELETE is a hard revoke; usage records survive for the audit trail.
pub async fn revoke_token(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(token_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    state
        .authz
        .require(&identity, Operation::RevokeToken, None)
        .await?;
    if !state.db.delete_token(token_id).await? {
        return Err(AppError::TokenNotFound);
    }
    tracing::info!(token_id = %token_id, by = %identity.user_id, "token revoked");
    Ok(Json(json!({ "token_id": token_id, "revoked": true })))
}

pub async fn modify_token(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(token_id): Path<Uuid>,
    Json(body): Json<ModifyTokenRequest>,
) -> Result<Json<TokenView>, AppError> {
    state
        .authz
        .require(&identity, Operation::ModifyToken, None)
        .await?;
    if body.is_active.is_none() && body.rate_limit.is_none() {
        return Err(AppError::BadRequest(
            "nothing to modify: provide is_active and/or rate_limit".into(),
        ));
    }

    if let Some(active) = body.is_active {
        if !state.db.set_token_active(token_id, active).await? {
            return Err(AppError::TokenNotFound);
        }
    }
    if let Some(rate_limit) = body.rate_limit {
        if rate_limit <= 0 {
            return Err(AppError::BadRequest("rate_limit must be positive".into()));
        }
        if !state.db.update_token_rate_limit(token_id, rate_limit).await? {
            return Err(AppError::TokenNotFound);
        }
    }

    let row = state
        .db
        .get_token(token_id)
        .await?
        .ok_or(AppError::TokenNotFound)?;
    tracing::info!(token_id = %token_id, by = %identity.user_id, "token modified");
    Ok(Json(TokenView::from(row)))
}

pub async fn token_usage(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(token_id): Path<Uuid>,
    Query(query): Query<UsageQuery>,
) -> Result<Json<Vec<TokenUsageRow>>, AppError> {
    state
        .authz
        .require(&identity, Operation::ViewTokenUsage, None)
        .await?;
    let days = query.days.unwrap_or(7).clamp(1, 90);
    let usage = state.db.list_token_usage(token_id, days).await?;
    Ok(Json(usage))
}
