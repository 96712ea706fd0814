use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, QueryBuilder};
use uuid::Uuid;

use crate::auth::rbac::JobScope;
use crate::jobs::model::{Job, JobStatus};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    // -- Token Operations --

    pub async fn insert_token(&self, token: &NewToken) -> sqlx::Result<()> {
        sqlx::query(
            r#"INSERT INTO tokens (token_id, token_hash, user_id, role, expires_at, rate_limit, created_by)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(token.token_id)
        .bind(&token.token_hash)
        .bind(&token.user_id)
        .bind(&token.role)
        .bind(token.expires_at)
        .bind(token.rate_limit)
        .bind(token.created_by)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_token_by_hash(&self, token_hash: &str) -> sqlx::Result<Option<TokenRow>> {
        sqlx::query_as::<_, TokenRow>(
            r#"SELECT token_id, token_hash, user_id, role, created_at, expires_at,
                      is_active, rate_limit, scopes, created_by, last_used_at
               FROM tokens WHERE token_hash = $1"#,
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn get_token(&self, token_id: Uuid) -> sqlx::Result<Option<TokenRow>> {
        sqlx::query_as::<_, TokenRow>(
            r#"SELECT token_id, token_hash, user_id, role, created_at, expires_at,
                      is_active, rate_limit, scopes, created_by, last_used_at
               FROM tokens WHERE token_id = $1"#,
        )
        .bind(token_id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn list_tokens(&self) -> sqlx::Result<Vec<TokenRow>> {
        sqlx::query_as::<_, TokenRow>(
            r#"SELECT token_id, token_hash, user_id, role, created_at, expires_at,
                      is_active, rate_limit, scopes, created_by, last_used_at
               FROM tokens ORDER BY created_at DESC"#,
        )
        .fetch_all(&self.pool)
        .await
    }

    /// Hard delete. Returns false if the token did not exist. Usage rows
    /// survive by design (no FK).
    pub async fn delete_token(&self, token_id: Uuid) -> sqlx::Result<bool> {
        let res = sqlx::query("DELETE FROM tokens WHERE token_id = $1")
            .bind(token_id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn set_token_active(&self, token_id: Uuid, active: bool) -> sqlx::Result<bool> {
        let res = sqlx::query("UPDATE tokens SET is_active = $2 WHERE token_id = $1")
            .bind(token_id)
            .bind(active)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn update_token_rate_limit(
        &self,
        token_id: Uuid,
        rate_limit: i32,
    ) -> sqlx::Result<bool> {
        let res = sqlx::query("UPDATE tokens SET rate_limit = $2 WHERE token_id = $1")
            .bind(token_id)
            .bind(rate_limit)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn touch_token_last_used(&self, token_id: Uuid) -> sqlx::Result<()> {
        sqlx::query("UPDATE tokens SET last_used_at = now() WHERE token_id = $1")
            .bind(token_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // -- Usage Audit Operations --

    pub async fn insert_token_usage(&self, rec: &TokenUsage) -> sqlx::Result<()> {
        sqlx::query(
            r#"INSERT INTO token_usage (token_id, ts, endpoint, method, request_bytes, latency_ms, status)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(rec.token_id)
        .bind(rec.ts)
        .bind(&rec.endpoint)
        .bind(&rec.method)
        .bind(rec.request_bytes)
        .bind(rec.latency_ms)
        .bind(rec.status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_token_usage(
        &self,
        token_id: Uuid,
        days: i64,
    ) -> sqlx::Result<Vec<TokenUsageRow>> {
        sqlx::query_as::<_, TokenUsageRow>(
            r#"SELECT id, token_id, ts, endpoint, method, request_bytes, latency_ms, status
               FROM token_usage
               WHERE token_id = $1 AND ts >= now() - make_interval(days => $2::int)
               ORDER BY ts DESC"#,
        )
        .bind(token_id)
        .bind(days)
        .fetch_all(&self.pool)
        .await
    }

    // -- Job Operations --

    /// Insert a fresh QUEUED job. Returns false on id collision so the
    /// caller can regenerate; an existing row is never overwritten.
    pub async fn insert_job(&self, job: &NewJob) -> sqlx::Result<bool> {
        let res = sqlx::query(
            r#"INSERT INTO jobs (job_id, owner_user_id, input_ref, status, options)
               VALUES ($1, $2, $3, 'QUEUED', $4)
               ON CONFLICT (job_id) DO NOTHING"#,
        )
        .bind(&job.job_id)
        .bind(&job.owner_user_id)
        .bind(&job.input_ref)
        .bind(&job.options)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn get_job(&self, job_id: &str) -> anyhow::Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!("{JOB_SELECT} WHERE job_id = $1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Job::try_from).transpose()
    }

    /// List jobs, newest first, restricted to what `scope` lets the caller
    /// see.
    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        scope: &JobScope,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<(Vec<Job>, i64)> {
        let total: i64 = {
            let mut qb = QueryBuilder::new("SELECT COUNT(*) FROM jobs WHERE TRUE");
            push_job_filters(&mut qb, status, scope);
            qb.build_query_scalar().fetch_one(&self.pool).await?
        };

        let mut qb = QueryBuilder::new(format!("{JOB_SELECT} WHERE TRUE"));
        push_job_filters(&mut qb, status, scope);
        qb.push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);
        let rows: Vec<JobRow> = qb.build_query_as().fetch_all(&self.pool).await?;

        let jobs = rows
            .into_iter()
            .map(Job::try_from)
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok((jobs, total))
    }

    /// Guarded conditional transition QUEUED -> RUNNING. Returns the number
    /// of rows updated (0 means the guard did not hold).
    pub async fn mark_job_running(&self, job_id: &str) -> sqlx::Result<u64> {
        let res = sqlx::query(
            r#"UPDATE jobs SET status = 'RUNNING', started_at = now()
               WHERE job_id = $1 AND status = 'QUEUED'"#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    /// Guarded conditional transition into a terminal state. The WHERE
    /// clause carries the expected prior state, so two racing control calls
    /// cannot both land: the loser updates zero rows.
    pub async fn mark_job_terminal(
        &self,
        job_id: &str,
        expected: JobStatus,
        to: JobStatus,
        result_ref: Option<&str>,
        error: Option<&str>,
    ) -> sqlx::Result<u64> {
        let res = sqlx::query(
            r#"UPDATE jobs
               SET status = $3, completed_at = now(), result_ref = $4, error = $5
               WHERE job_id = $1 AND status = $2"#,
        )
        .bind(job_id)
        .bind(expected.as_str())
        .bind(to.as_str())
        .bind(result_ref)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    /// Atomically claim the oldest unthrottled QUEUED job for execution.
    /// `SKIP LOCKED` keeps concurrent worker instances from double-claiming.
    pub async fn claim_next_job(&self) -> anyhow::Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"UPDATE jobs SET status = 'RUNNING', started_at = now()
               WHERE job_id = (
                   SELECT job_id FROM jobs
                   WHERE status = 'QUEUED' AND NOT throttled
                   ORDER BY created_at
                   LIMIT 1
                   FOR UPDATE SKIP LOCKED
               )
               RETURNING job_id, owner_user_id, input_ref, status, result_ref, error,
                         created_at, started_at, completed_at, throttled, throttled_by, options"#,
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(Job::try_from).transpose()
    }

    /// Attribute-only mutation; valid on QUEUED or RUNNING jobs, never a
    /// status change. Returns rows updated.
    pub async fn set_job_throttle(
        &self,
        job_id: &str,
        throttled: bool,
        by: Option<&str>,
    ) -> sqlx::Result<u64> {
        let res = sqlx::query(
            r#"UPDATE jobs SET throttled = $2, throttled_by = $3
               WHERE job_id = $1 AND status IN ('QUEUED', 'RUNNING')"#,
        )
        .bind(job_id)
        .bind(throttled)
        .bind(by)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    // -- Access Grant Operations --

    /// Idempotent: re-granting the same (job, user) pair is a no-op.
    pub async fn insert_grant(
        &self,
        job_id: &str,
        granted_to: &str,
        granted_by: &str,
    ) -> sqlx::Result<()> {
        sqlx::query(
            r#"INSERT INTO job_access_grants (job_id, granted_to, granted_by)
               VALUES ($1, $2, $3)
               ON CONFLICT (job_id, granted_to) DO NOTHING"#,
        )
        .bind(job_id)
        .bind(granted_to)
        .bind(granted_by)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn grant_exists(&self, job_id: &str, user_id: &str) -> sqlx::Result<bool> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM job_access_grants WHERE job_id = $1 AND granted_to = $2)",
        )
        .bind(job_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn ping(&self) -> sqlx::Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

const JOB_SELECT: &str = r#"SELECT job_id, owner_user_id, input_ref, status, result_ref, error,
       created_at, started_at, completed_at, throttled, throttled_by, options
FROM jobs"#;

fn push_job_filters(
    qb: &mut QueryBuilder<'_, sqlx::Postgres>,
    status: Option<JobStatus>,
    scope: &JobScope,
) {
    if let Some(status) = status {
        qb.push(" AND status = ").push_bind(status.as_str());
    }
    match scope {
        JobScope::All => {}
        JobScope::OwnedOrGranted(user) => {
            qb.push(" AND (owner_user_id = ")
                .push_bind(user.clone())
                .push(" OR job_id IN (SELECT job_id FROM job_access_grants WHERE granted_to = ")
                .push_bind(user.clone())
                .push("))");
        }
        // Reader scope: grants only. An owned-but-ungranted job must not
        // appear, because the per-job view would reject it.
        JobScope::GrantedOnly(user) => {
            qb.push(" AND job_id IN (SELECT job_id FROM job_access_grants WHERE granted_to = ")
                .push_bind(user.clone())
                .push(")");
        }
    }
}

// -- Row types --

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TokenRow {
    pub token_id: Uuid,
    pub token_hash: String,
    pub user_id: String,
    pub role: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub rate_limit: i32,
    pub scopes: serde_json::Value,
    pub created_by: Option<Uuid>,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct NewToken {
    pub token_id: Uuid,
    pub token_hash: String,
    pub user_id: String,
    pub role: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub rate_limit: i32,
    pub created_by: Option<Uuid>,
}

#[derive(Debug)]
pub struct NewJob {
    pub job_id: String,
    pub owner_user_id: String,
    pub input_ref: String,
    pub options: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct TokenUsageRow {
    pub id: i64,
    pub token_id: Uuid,
    pub ts: DateTime<Utc>,
    pub endpoint: String,
    pub method: String,
    pub request_bytes: Option<i64>,
    pub latency_ms: Option<i32>,
    pub status: i16,
}

/// Append-only audit record for one authenticated call.
#[derive(Debug, Clone)]
pub struct TokenUsage {
    pub token_id: Uuid,
    pub ts: DateTime<Utc>,
    pub endpoint: String,
    pub method: String,
    pub request_bytes: Option<i64>,
    pub latency_ms: Option<i32>,
    pub status: i16,
}

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    job_id: String,
    owner_user_id: String,
    input_ref: String,
    status: String,
    result_ref: Option<String>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    throttled: bool,
    throttled_by: Option<String>,
    options: serde_json::Value,
}

impl TryFrom<JobRow> for Job {
    type Error = anyhow::Error;

    fn try_from(row: JobRow) -> anyhow::Result<Self> {
        let status = JobStatus::parse(&row.status)
            .ok_or_else(|| anyhow::anyhow!("job {} has unknown status '{}'", row.job_id, row.status))?;
        Ok(Job {
            job_id: row.job_id,
            owner_user_id: row.owner_user_id,
            input_ref: row.input_ref,
            status,
            result_ref: row.result_ref,
            error: row.error,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            throttled: row.throttled,
            throttled_by: row.throttled_by,
            options: row.options,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter_sql(status: Option<JobStatus>, scope: &JobScope) -> String {
        let mut qb = QueryBuilder::new("SELECT COUNT(*) FROM jobs WHERE TRUE");
        push_job_filters(&mut qb, status, scope);
        qb.sql().to_string()
    }

    #[test]
    fn test_all_scope_adds_no_visibility_clause() {
        let sql = filter_sql(None, &JobScope::All);
        assert!(!sql.contains("owner_user_id"));
        assert!(!sql.contains("job_access_grants"));
    }

    #[test]
    fn test_owned_or_granted_scope_reaches_both() {
        let sql = filter_sql(None, &JobScope::OwnedOrGranted("alice".into()));
        assert!(sql.contains("owner_user_id"));
        assert!(sql.contains("job_access_grants"));
    }

    #[test]
    fn test_granted_only_scope_ignores_ownership() {
        let sql = filter_sql(None, &JobScope::GrantedOnly("bob".into()));
        assert!(sql.contains("job_access_grants"));
        assert!(!sql.contains("owner_user_id"));
    }

    #[test]
    fn test_status_filter_composes_with_scope() {
        let sql = filter_sql(
            Some(JobStatus::Queued),
            &JobScope::GrantedOnly("bob".into()),
        );
        assert!(sql.contains("status = "));
        assert!(sql.contains("job_access_grants"));
    }
}
