//! End-to-end scenario tests for the control-plane rules that do not need
//! live backing stores: credential shape, the permission table exercised
//! as user stories, guarded transition races and rate-limiter fail modes.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use pdf2md::auth::authenticator::{generate_credential, hash_credential, parse_credential};
use pdf2md::auth::rbac::{decide, Operation};
use pdf2md::auth::{Identity, Role};
use pdf2md::errors::AppError;
use pdf2md::jobs::model::{Job, JobStatus};
use pdf2md::ratelimit::{FailMode, RateDecision, RateLimitGate, RateLimiter};

fn identity(user_id: &str, role: Role) -> Identity {
    Identity {
        token_id: Uuid::new_v4(),
        user_id: user_id.to_string(),
        role,
        rate_limit: role.default_rate_limit(),
    }
}

fn job(job_id: &str, owner: &str, status: JobStatus) -> Job {
    Job {
        job_id: job_id.to_string(),
        owner_user_id: owner.to_string(),
        input_ref: format!("uploads/{}.pdf", Uuid::new_v4()),
        status,
        result_ref: None,
        error: None,
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
        throttled: false,
        throttled_by: None,
        options: serde_json::json!({}),
    }
}

// ── Credentials ──────────────────────────────────────────────

#[test]
fn test_generated_credentials_parse_and_hash_deterministically() {
    let credential = generate_credential();
    assert!(parse_credential(&credential).is_ok());

    let a = hash_credential("pepper-one", &credential);
    let b = hash_credential("pepper-one", &credential);
    let c = hash_credential("pepper-two", &credential);
    assert_eq!(a, b);
    assert_ne!(a, c, "hash must depend on the server-side key");
    assert_ne!(a, credential, "secret must never equal its stored form");
}

#[test]
fn test_foreign_shapes_are_rejected_before_any_lookup() {
    for bad in [
        "",
        "pdf2md_",
        "pdf2md_short",
        "Bearer pdf2md_AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA",
        "sk-this-is-some-other-vendor-token-format-entirely",
    ] {
        assert!(parse_credential(bad).is_err(), "accepted {bad:?}");
    }
}

// ── Scenario: writer stops its own job, nothing else ─────────

#[test]
fn test_writer_can_stop_own_running_job_but_not_others() {
    let alice = identity("alice", Role::JobWriter);
    let own = job("aaaaaaaaaa", "alice", JobStatus::Running);
    let other = job("bbbbbbbbbb", "bob", JobStatus::Running);

    assert!(decide(&alice, Operation::StopJob, Some(&own), false));
    assert!(!decide(&alice, Operation::StopJob, Some(&other), false));
    // A grant shares visibility, never control.
    assert!(!decide(&alice, Operation::StopJob, Some(&other), true));
    // Ownership does not buy throttling either.
    assert!(!decide(&alice, Operation::ThrottleJob, Some(&own), false));
}

// ── Scenario: grantee gets read-only visibility ──────────────

#[test]
fn test_grantee_sees_the_job_and_nothing_more() {
    let reader = identity("carol", Role::JobReader);
    let shared = job("cccccccccc", "alice", JobStatus::Complete);

    assert!(!decide(&reader, Operation::ViewJob, Some(&shared), false));
    assert!(decide(&reader, Operation::ViewJob, Some(&shared), true));

    for op in [
        Operation::StopJob,
        Operation::CancelJob,
        Operation::ThrottleJob,
        Operation::GrantAccess,
        Operation::CreateJob,
    ] {
        assert!(
            !decide(&reader, op, Some(&shared), true),
            "grant leaked {op:?} to a reader"
        );
    }
}

#[test]
fn test_manager_controls_any_job_but_no_tokens() {
    let manager = identity("ops", Role::JobManager);
    let foreign = job("dddddddddd", "alice", JobStatus::Running);

    assert!(decide(&manager, Operation::StopJob, Some(&foreign), false));
    assert!(decide(&manager, Operation::ThrottleJob, Some(&foreign), false));
    assert!(!decide(&manager, Operation::CreateToken, None, false));
    assert!(!decide(&manager, Operation::ListTokens, None, false));
}

// ── Scenario: racing stop and complete pick exactly one winner ──

/// The database-side guard in miniature: apply succeeds only when the
/// current status equals the expected one.
fn guarded_apply(current: &mut JobStatus, expected: JobStatus, to: JobStatus) -> bool {
    if *current == expected && JobStatus::can_transition(expected, to) {
        *current = to;
        true
    } else {
        false
    }
}

#[test]
fn test_racing_terminal_writes_have_exactly_one_winner() {
    // Both orders: whoever lands first wins, the loser is rejected and the
    // state stays terminal.
    for (first, second) in [
        (JobStatus::Stopped, JobStatus::Complete),
        (JobStatus::Complete, JobStatus::Stopped),
    ] {
        let mut status = JobStatus::Running;
        assert!(guarded_apply(&mut status, JobStatus::Running, first));
        assert!(!guarded_apply(&mut status, JobStatus::Running, second));
        assert_eq!(status, first);
        assert!(status.is_terminal());
    }
}

#[test]
fn test_terminal_states_accept_no_further_transitions() {
    for terminal in [
        JobStatus::Complete,
        JobStatus::Failed,
        JobStatus::Cancelled,
        JobStatus::Stopped,
    ] {
        for to in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Complete,
            JobStatus::Failed,
            JobStatus::Cancelled,
            JobStatus::Stopped,
        ] {
            let mut status = terminal;
            assert!(!guarded_apply(&mut status, terminal, to));
            assert_eq!(status, terminal);
        }
    }
}

// ── Scenario: rate limiter backend outage ────────────────────

struct DownBackend;

#[async_trait]
impl RateLimiter for DownBackend {
    async fn allow(&self, _key: &str, _limit: u32) -> RateDecision {
        RateDecision::Unavailable
    }
}

#[tokio::test]
async fn test_fail_closed_denies_every_request_during_outage() {
    let gate = RateLimitGate::new(Arc::new(DownBackend), FailMode::Closed);
    let caller = identity("alice", Role::JobWriter);

    for _ in 0..25 {
        let err = gate.check(&caller).await.unwrap_err();
        assert!(matches!(err, AppError::RateLimiterUnavailable));
    }
}

#[tokio::test]
async fn test_fail_open_admits_every_request_during_outage() {
    let gate = RateLimitGate::new(Arc::new(DownBackend), FailMode::Open);
    let caller = identity("alice", Role::JobWriter);

    for _ in 0..25 {
        let quota = gate.check(&caller).await.expect("fail-open must admit");
        assert_eq!(quota.limit, caller.rate_limit as u32);
    }
}
