//! Background conversion worker.
//!
//! One loop per process: claim the oldest runnable job, pull its input
//! from the blob store, run the sandboxed extractor, persist the result
//! and finalize the row. Claims use a row-locked conditional update, so
//! any number of instances can run the same loop without double-claiming.
//!
//! Stop propagation: a stop request flips the row RUNNING -> STOPPED first
//! and then fires the local kill handle. Stops can land on a different
//! instance than the one running the job, so while the sandbox runs the
//! worker also polls the row and kills on STOPPED; the committed row is the
//! source of truth either way, the handle only shortens the grace on the
//! local instance. The worker's own finalize loses the guard after a stop
//! and treats that as a benign race, not a fault.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;

use crate::errors::AppError;
use crate::sandbox::{SandboxDispatcher, SandboxFailure};
use crate::store::blob::BlobStore;

use super::model::{Job, JobStatus};
use super::registry::JobRegistry;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Bound on how long a stop issued on another instance takes to reach the
/// child process.
const STOP_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Kill handles for in-flight jobs, keyed by job id. Shared between the
/// worker loop and the stop endpoint.
#[derive(Clone, Default)]
pub struct WorkerControl {
    inflight: Arc<DashMap<String, Arc<Notify>>>,
}

impl WorkerControl {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, job_id: &str) -> Arc<Notify> {
        let cancel = Arc::new(Notify::new());
        self.inflight.insert(job_id.to_string(), cancel.clone());
        cancel
    }

    fn unregister(&self, job_id: &str) {
        self.inflight.remove(job_id);
    }

    /// Kill the extractor for `job_id` if this instance is running it.
    /// A miss is normal: the job may be done already, or running on another
    /// instance, whose status watcher picks the STOPPED row up instead.
    pub fn signal_stop(&self, job_id: &str) {
        if let Some(entry) = self.inflight.get(job_id) {
            entry.notify_one();
            tracing::info!(job_id = %job_id, "stop signalled to in-flight worker");
        }
    }
}

/// Spawn the conversion loop. Call once at startup.
pub fn spawn(
    registry: JobRegistry,
    blob: BlobStore,
    dispatcher: SandboxDispatcher,
    control: WorkerControl,
) {
    tokio::spawn(async move {
        tracing::info!("conversion worker started");
        loop {
            match registry.claim_next().await {
                Ok(Some(job)) => {
                    let job_id = job.job_id.clone();
                    if let Err(e) = process(&registry, &blob, &dispatcher, &control, job).await {
                        tracing::error!(job_id = %job_id, "job processing error: {}", e);
                    }
                }
                Ok(None) => tokio::time::sleep(POLL_INTERVAL).await,
                Err(e) => {
                    tracing::error!("job claim failed: {}", e);
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }
    });
}

async fn process(
    registry: &JobRegistry,
    blob: &BlobStore,
    dispatcher: &SandboxDispatcher,
    control: &WorkerControl,
    job: Job,
) -> Result<(), AppError> {
    let job_id = job.job_id.clone();
    tracing::info!(job_id = %job_id, owner = %job.owner_user_id, "job claimed");

    let input = match blob.get(&job.input_ref).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(job_id = %job_id, "failed to fetch job input: {}", e);
            return finalize(registry, &job_id, registry.fail(&job_id, "storage").await).await;
        }
    };

    let cancel = control.register(&job_id);
    let watcher = spawn_stop_watcher(registry.clone(), job_id.clone(), cancel.clone());
    let outcome = dispatcher.run(input, &job.options, cancel).await;
    watcher.abort();
    control.unregister(&job_id);

    match outcome {
        Ok(output) => {
            let result_ref = BlobStore::result_ref(&job_id, result_extension(&job.options));
            if let Err(e) = blob.put(&result_ref, output).await {
                tracing::error!(job_id = %job_id, "failed to persist result: {}", e);
                return finalize(registry, &job_id, registry.fail(&job_id, "storage").await).await;
            }
            finalize(registry, &job_id, registry.complete(&job_id, &result_ref).await).await
        }
        Err(SandboxFailure::Cancelled) => {
            // The stop endpoint already moved the row to STOPPED; nothing
            // left to record.
            tracing::info!(job_id = %job_id, "worker killed by stop request");
            Ok(())
        }
        Err(failure) => {
            finalize(
                registry,
                &job_id,
                registry.fail(&job_id, failure.error_category()).await,
            )
            .await
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum StopWatch {
    /// The row went STOPPED: kill the local child.
    Kill,
    /// The row is terminal or gone; nothing left to watch.
    Done,
    Keep,
}

fn stop_watch_step(job: Option<&Job>) -> StopWatch {
    match job {
        Some(job) if job.status == JobStatus::Stopped => StopWatch::Kill,
        Some(job) if job.status.is_terminal() => StopWatch::Done,
        Some(_) => StopWatch::Keep,
        None => StopWatch::Done,
    }
}

/// Watch the job row while the sandbox runs so a stop committed by another
/// instance still kills this child within [`STOP_POLL_INTERVAL`].
fn spawn_stop_watcher(
    registry: JobRegistry,
    job_id: String,
    cancel: Arc<Notify>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STOP_POLL_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            match registry.get(&job_id).await {
                Ok(job) => match stop_watch_step(job.as_ref()) {
                    StopWatch::Kill => {
                        tracing::info!(job_id = %job_id, "job stopped elsewhere, killing local worker");
                        cancel.notify_one();
                        break;
                    }
                    StopWatch::Done => break,
                    StopWatch::Keep => {}
                },
                Err(e) => {
                    tracing::debug!(job_id = %job_id, "stop watch poll failed: {}", e);
                }
            }
        }
    })
}

/// Absorb the stop-vs-finalize race: when our guarded update loses because
/// an operator stopped the job first, that is expected, not an anomaly.
async fn finalize(
    registry: &JobRegistry,
    job_id: &str,
    result: Result<(), AppError>,
) -> Result<(), AppError> {
    match result {
        Ok(()) => Ok(()),
        Err(AppError::InvalidTransition { .. }) => match registry.get(job_id).await? {
            Some(job) if job.status == JobStatus::Stopped => {
                tracing::info!(job_id = %job_id, "job was stopped while running, result discarded");
                Ok(())
            }
            _ => Err(AppError::Internal(anyhow::anyhow!(
                "job {job_id} left RUNNING by another writer"
            ))),
        },
        Err(e) => Err(e),
    }
}

// Formats are validated at the request boundary; anything else here would
// mean a row written by an unknown writer, and markdown is the safe default.
fn result_extension(options: &serde_json::Value) -> &'static str {
    match options.get("output_format").and_then(|v| v.as_str()) {
        Some("json") => "json",
        Some("yaml") => "yml",
        Some("text") => "txt",
        _ => "md",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_extension_follows_options() {
        assert_eq!(result_extension(&serde_json::json!({})), "md");
        assert_eq!(
            result_extension(&serde_json::json!({"output_format": "markdown"})),
            "md"
        );
        assert_eq!(
            result_extension(&serde_json::json!({"output_format": "json"})),
            "json"
        );
        assert_eq!(
            result_extension(&serde_json::json!({"output_format": "yaml"})),
            "yml"
        );
        assert_eq!(
            result_extension(&serde_json::json!({"output_format": "text"})),
            "txt"
        );
    }

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
    fn test_stop_watch_kills_only_on_a_stopped_row() {
        // A stop committed by any instance shows up as the STOPPED status.
        let stopped = job_with_status(JobStatus::Stopped);
        assert_eq!(stop_watch_step(Some(&stopped)), StopWatch::Kill);

        let running = job_with_status(JobStatus::Running);
        assert_eq!(stop_watch_step(Some(&running)), StopWatch::Keep);

        for terminal in [JobStatus::Complete, JobStatus::Failed, JobStatus::Cancelled] {
            let job = job_with_status(terminal);
            assert_eq!(stop_watch_step(Some(&job)), StopWatch::Done, "{terminal}");
        }
        assert_eq!(stop_watch_step(None), StopWatch::Done);
    }

    #[tokio::test]
    async fn test_stop_signal_only_reaches_registered_jobs() {
        let control = WorkerControl::new();
        let cancel = control.register("aB3xK9mN2p");

        // Unknown job id is a no-op.
        control.signal_stop("zzzzzzzzzz");

        control.signal_stop("aB3xK9mN2p");
        tokio::time::timeout(Duration::from_secs(1), cancel.notified())
            .await
            .expect("registered handle should be notified");

        control.unregister("aB3xK9mN2p");
        assert!(control.inflight.is_empty());
    }
}
