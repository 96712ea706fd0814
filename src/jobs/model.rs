use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Job lifecycle:
///
/// ```text
/// QUEUED ──► RUNNING ──► COMPLETE
///   │           │   └──► FAILED
///   │           └──────► STOPPED   (operator-initiated exit)
///   └──────────────────► CANCELLED (work never started)
/// ```
///
/// COMPLETE, FAILED, CANCELLED and STOPPED are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Complete,
    Failed,
    Cancelled,
    Stopped,
}

impl JobStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(JobStatus::Queued),
            "RUNNING" => Some(JobStatus::Running),
            "COMPLETE" => Some(JobStatus::Complete),
            "FAILED" => Some(JobStatus::Failed),
            "CANCELLED" => Some(JobStatus::Cancelled),
            "STOPPED" => Some(JobStatus::Stopped),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Complete => "COMPLETE",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::Stopped => "STOPPED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Complete | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Stopped
        )
    }

    /// The state-machine edge set. The registry enforces this with guarded
    /// conditional updates; this predicate is the single source of truth.
    pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (from, to),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Complete)
                | (Running, Failed)
                | (Running, Stopped)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub owner_user_id: String,
    pub input_ref: String,
    pub status: JobStatus,
    pub result_ref: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub throttled: bool,
    pub throttled_by: Option<String>,
    pub options: serde_json::Value,
}
