//! Job registry: the only writer of job rows.
//!
//! Every transition is a conditional update guarded by the expected prior
//! state, applied in one statement. When two control calls race (say an
//! operator stop against natural completion) the database picks the winner;
//! the loser's update matches zero rows and is rejected here rather than
//! silently overwriting a terminal state.

use crate::auth::JobScope;
use crate::errors::AppError;
use crate::store::postgres::{NewJob, PgStore};

use super::id::generate_job_id;
use super::model::{Job, JobStatus};

const MAX_ID_ATTEMPTS: usize = 10;

#[derive(Clone)]
pub struct JobRegistry {
    db: PgStore,
}

impl JobRegistry {
    pub fn new(db: PgStore) -> Self {
        Self { db }
    }

    /// Create a QUEUED job with a fresh id. `input_ref` must already hold
    /// the uploaded bytes: the moment this row commits, any worker instance
    /// may claim it. An id collision regenerates and retries; an existing
    /// row is never overwritten.
    pub async fn create(
        &self,
        owner_user_id: &str,
        options: serde_json::Value,
        input_ref: &str,
    ) -> Result<Job, AppError> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let job_id = generate_job_id();
            let new_job = NewJob {
                job_id: job_id.clone(),
                owner_user_id: owner_user_id.to_string(),
                input_ref: input_ref.to_string(),
                options: options.clone(),
            };
            if self.db.insert_job(&new_job).await? {
                let job = self
                    .db
                    .get_job(&job_id)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("job {job_id} vanished after insert"))?;
                tracing::info!(job_id = %job.job_id, owner = %owner_user_id, "job created");
                return Ok(job);
            }
            tracing::warn!(job_id = %job_id, "job id collision, regenerating");
        }
        Err(anyhow::anyhow!("failed to generate a unique job id after {MAX_ID_ATTEMPTS} attempts").into())
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<Job>, AppError> {
        Ok(self.db.get_job(job_id).await?)
    }

    pub async fn list(
        &self,
        status: Option<JobStatus>,
        scope: &JobScope,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Job>, i64), AppError> {
        Ok(self.db.list_jobs(status, scope, limit, offset).await?)
    }

    /// QUEUED -> RUNNING by id (the worker's claim path flips the status
    /// itself). Idempotent: a job already RUNNING is a no-op so dispatch
    /// retries do not surface as faults.
    pub async fn start(&self, job_id: &str) -> Result<(), AppError> {
        if self.db.mark_job_running(job_id).await? == 1 {
            return Ok(());
        }
        Self::diagnose_start(self.db.get_job(job_id).await?)
    }

    /// Zero-row diagnosis for `start`: the guard only updates QUEUED rows,
    /// so a miss is either idempotence, absence or a real fault.
    fn diagnose_start(job: Option<Job>) -> Result<(), AppError> {
        match job {
            None => Err(AppError::JobNotFound),
            Some(job) if job.status == JobStatus::Running => Ok(()),
            Some(job) => Err(invalid(job, JobStatus::Running)),
        }
    }

    /// RUNNING -> COMPLETE. Rejected from any other state: only the
    /// dispatcher calls this, so a failed guard is a dispatcher bug.
    pub async fn complete(&self, job_id: &str, result_ref: &str) -> Result<(), AppError> {
        self.terminal(job_id, JobStatus::Running, JobStatus::Complete, Some(result_ref), None)
            .await
    }

    /// RUNNING -> FAILED with a generic error category.
    pub async fn fail(&self, job_id: &str, error: &str) -> Result<(), AppError> {
        self.terminal(job_id, JobStatus::Running, JobStatus::Failed, None, Some(error))
            .await
    }

    /// RUNNING -> STOPPED (operator-initiated). Safe to race against
    /// complete/fail: whichever conditional update lands first wins.
    pub async fn stop(&self, job_id: &str) -> Result<(), AppError> {
        self.terminal(job_id, JobStatus::Running, JobStatus::Stopped, None, None)
            .await
    }

    /// QUEUED -> CANCELLED. A RUNNING job must be stopped instead; cancel
    /// means the work never started.
    pub async fn cancel(&self, job_id: &str) -> Result<(), AppError> {
        self.terminal(job_id, JobStatus::Queued, JobStatus::Cancelled, None, None)
            .await
    }

    /// Attribute mutation on an in-flight job; never a status change.
    pub async fn throttle(
        &self,
        job_id: &str,
        throttled: bool,
        by: &str,
    ) -> Result<(), AppError> {
        let by_user = throttled.then_some(by);
        if self.db.set_job_throttle(job_id, throttled, by_user).await? == 1 {
            tracing::info!(job_id = %job_id, throttled, by = %by, "job throttle updated");
            return Ok(());
        }
        match self.db.get_job(job_id).await? {
            None => Err(AppError::JobNotFound),
            Some(_) => Err(AppError::Conflict(
                "job is no longer queued or running".to_string(),
            )),
        }
    }

    /// Idempotent read-access grant; requires the job to exist.
    pub async fn grant_access(
        &self,
        job_id: &str,
        granted_to: &str,
        granted_by: &str,
    ) -> Result<(), AppError> {
        if self.db.get_job(job_id).await?.is_none() {
            return Err(AppError::JobNotFound);
        }
        self.db.insert_grant(job_id, granted_to, granted_by).await?;
        tracing::info!(job_id = %job_id, to = %granted_to, by = %granted_by, "job access granted");
        Ok(())
    }

    /// Worker path: atomically claim the next runnable job.
    pub async fn claim_next(&self) -> Result<Option<Job>, AppError> {
        Ok(self.db.claim_next_job().await?)
    }

    async fn terminal(
        &self,
        job_id: &str,
        expected: JobStatus,
        to: JobStatus,
        result_ref: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), AppError> {
        debug_assert!(JobStatus::can_transition(expected, to));
        let updated = self
            .db
            .mark_job_terminal(job_id, expected, to, result_ref, error)
            .await?;
        if updated == 1 {
            tracing::info!(job_id = %job_id, status = %to, "job transitioned");
            return Ok(());
        }
        match self.db.get_job(job_id).await? {
            None => Err(AppError::JobNotFound),
            Some(job) => Err(invalid(job, to)),
        }
    }
}

fn invalid(job: Job, to: JobStatus) -> AppError {
    AppError::InvalidTransition {
        job_id: job.job_id,
        from: job.status.as_str().to_string(),
        to: to.as_str().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_with_status(status: JobStatus) -> Job {
        Job {
            job_id: "aB3xK9mN2p".into(),
            owner_user_id: "alice".into(),
            input_ref: "uploads/9f3a.pdf".into(),
            status,
            result_ref: None,
            error: None,
            created_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
            throttled: false,
            throttled_by: None,
            options: serde_json::json!({}),
        }
    }

    #[test]
    fn test_start_is_idempotent_when_already_running() {
        // The guarded update matched zero rows because another dispatch got
        // there first; that is a no-op, not a fault.
        let job = job_with_status(JobStatus::Running);
        assert!(JobRegistry::diagnose_start(Some(job)).is_ok());
    }

    #[test]
    fn test_start_rejects_missing_jobs() {
        assert!(matches!(
            JobRegistry::diagnose_start(None),
            Err(AppError::JobNotFound)
        ));
    }

    #[test]
    fn test_start_rejects_non_queued_states() {
        for status in [
            JobStatus::Complete,
            JobStatus::Failed,
            JobStatus::Cancelled,
            JobStatus::Stopped,
        ] {
            let job = job_with_status(status);
            match JobRegistry::diagnose_start(Some(job)) {
                Err(AppError::InvalidTransition { from, to, .. }) => {
                    assert_eq!(from, status.as_str());
                    assert_eq!(to, "RUNNING");
                }
                other => panic!("expected invalid transition for {status}, got {other:?}"),
            }
        }
    }
}
