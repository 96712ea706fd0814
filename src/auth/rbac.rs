//! Role-based authorization.
//!
//! The permission table is enumerated cell by cell rather than derived from
//! role ordering: admin deliberately lacks nothing here, but job_writer can
//! stop its own jobs while being unable to throttle them, and job_reader
//! only ever sees jobs it was explicitly granted. Keeping every cell
//! explicit makes each decision auditable and testable in isolation.

use crate::errors::AppError;
use crate::jobs::model::Job;
use crate::store::postgres::PgStore;

use super::models::{Identity, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    CreateJob,
    ViewJob,
    StopJob,
    CancelJob,
    ThrottleJob,
    GrantAccess,
    CreateToken,
    RevokeToken,
    ListTokens,
    ModifyToken,
    ViewTokenUsage,
}

/// How a role may exercise an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    /// Operation absent from the role's set.
    Deny,
    /// Allowed on any target.
    Any,
    /// Allowed only when the identity owns the target job.
    Own,
    /// Allowed on owned jobs or jobs with a read grant.
    OwnOrGranted,
    /// Allowed only through a read grant.
    Granted,
}

/// The static permission table. One match arm per (role, operation) cell.
pub fn permit(role: Role, op: Operation) -> Permit {
    use Operation::*;
    use Permit::*;
    use Role::*;

    match (role, op) {
        (Admin, CreateJob) => Any,
        (Admin, ViewJob) => Any,
        (Admin, StopJob) => Any,
        (Admin, CancelJob) => Any,
        (Admin, ThrottleJob) => Any,
        (Admin, GrantAccess) => Any,
        (Admin, CreateToken) => Any,
        (Admin, RevokeToken) => Any,
        (Admin, ListTokens) => Any,
        (Admin, ModifyToken) => Any,
        (Admin, ViewTokenUsage) => Any,

        (JobManager, CreateJob) => Any,
        (JobManager, ViewJob) => Any,
        (JobManager, StopJob) => Any,
        (JobManager, CancelJob) => Any,
        (JobManager, ThrottleJob) => Any,
        (JobManager, GrantAccess) => Any,
        (JobManager, CreateToken) => Deny,
        (JobManager, RevokeToken) => Deny,
        (JobManager, ListTokens) => Deny,
        (JobManager, ModifyToken) => Deny,
        (JobManager, ViewTokenUsage) => Deny,

        (JobWriter, CreateJob) => Any,
        (JobWriter, ViewJob) => OwnOrGranted,
        (JobWriter, StopJob) => Own,
        (JobWriter, CancelJob) => Own,
        (JobWriter, ThrottleJob) => Deny,
        (JobWriter, GrantAccess) => Own,
        (JobWriter, CreateToken) => Deny,
        (JobWriter, RevokeToken) => Deny,
        (JobWriter, ListTokens) => Deny,
        (JobWriter, ModifyToken) => Deny,
        (JobWriter, ViewTokenUsage) => Deny,

        (JobReader, CreateJob) => Deny,
        (JobReader, ViewJob) => Granted,
        (JobReader, StopJob) => Deny,
        (JobReader, CancelJob) => Deny,
        (JobReader, ThrottleJob) => Deny,
        (JobReader, GrantAccess) => Deny,
        (JobReader, CreateToken) => Deny,
        (JobReader, RevokeToken) => Deny,
        (JobReader, ListTokens) => Deny,
        (JobReader, ModifyToken) => Deny,
        (JobReader, ViewTokenUsage) => Deny,
    }
}

/// Pure decision given the facts. `has_grant` is whether a
/// `job_access_grants` row exists for (job, identity.user_id).
pub fn decide(identity: &Identity, op: Operation, job: Option<&Job>, has_grant: bool) -> bool {
    match permit(identity.role, op) {
        Permit::Deny => false,
        Permit::Any => true,
        Permit::Own => job.is_some_and(|j| j.owner_user_id == identity.user_id),
        Permit::OwnOrGranted => {
            job.is_some_and(|j| j.owner_user_id == identity.user_id) || has_grant
        }
        Permit::Granted => has_grant,
    }
}

/// Async facade that fetches the grant fact when the cell needs it.
#[derive(Clone)]
pub struct Authorizer {
    db: PgStore,
}

impl Authorizer {
    pub fn new(db: PgStore) -> Self {
        Self { db }
    }

    pub async fn require(
        &self,
        identity: &Identity,
        op: Operation,
        job: Option<&Job>,
    ) -> Result<(), AppError> {
        let needs_grant = matches!(
            permit(identity.role, op),
            Permit::Granted | Permit::OwnOrGranted
        );
        let has_grant = match (needs_grant, job) {
            (true, Some(job)) => self.db.grant_exists(&job.job_id, &identity.user_id).await?,
            _ => false,
        };

        if decide(identity, op, job, has_grant) {
            Ok(())
        } else {
            tracing::warn!(
                user = %identity.user_id,
                role = %identity.role,
                operation = ?op,
                job = job.map(|j| j.job_id.as_str()).unwrap_or("-"),
                "authorization denied"
            );
            Err(AppError::Forbidden)
        }
    }

}

/// How far a listing reaches. Mirrors the ViewJob permit for the role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobScope {
    All,
    OwnedOrGranted(String),
    GrantedOnly(String),
}

/// Listing visibility for `identity`, derived from its ViewJob cell so
/// `GET /jobs` can never show a job that `GET /jobs/:id` would 403.
pub fn list_scope(identity: &Identity) -> JobScope {
    match permit(identity.role, Operation::ViewJob) {
        Permit::Any => JobScope::All,
        Permit::Own | Permit::OwnOrGranted => JobScope::OwnedOrGranted(identity.user_id.clone()),
        // Readers view through grants only; ownership alone shows nothing.
        Permit::Granted | Permit::Deny => JobScope::GrantedOnly(identity.user_id.clone()),
    }
}
