//! Async usage-audit writer. Fires off a Tokio task to append the
//! `token_usage` row without blocking the response path; the trail is
//! write-only from the hot path and never mutated.

use crate::store::postgres::{PgStore, TokenUsage};

pub fn log_async(db: PgStore, entry: TokenUsage) {
    tokio::spawn(async move {
        if let Err(e) = db.insert_token_usage(&entry).await {
            tracing::error!(token_id = %entry.token_id, "failed to write usage record: {}", e);
        } else {
            tracing::debug!(token_id = %entry.token_id, endpoint = %entry.endpoint, "usage recorded");
        }
    });
}
