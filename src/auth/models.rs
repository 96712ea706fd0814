use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Access tiers, ordered by breadth. The permission sets are enumerated
/// explicitly in `rbac`; there is no inheritance between tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    JobManager,
    JobWriter,
    JobReader,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Role::Admin),
            "job_manager" => Some(Role::JobManager),
            "job_writer" => Some(Role::JobWriter),
            "job_reader" => Some(Role::JobReader),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::JobManager => "job_manager",
            Role::JobWriter => "job_writer",
            Role::JobReader => "job_reader",
        }
    }

    /// Default requests-per-minute ceiling, overridable per token.
    pub fn default_rate_limit(&self) -> i32 {
        match self {
            Role::Admin => 1000,
            Role::JobManager => 500,
            Role::JobWriter => 100,
            Role::JobReader => 50,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The (user, role) pair resolved from a valid credential, plus the token
/// attributes the request pipeline needs.
#[derive(Debug, Clone)]
pub struct Identity {
    pub token_id: Uuid,
    pub user_id: String,
    pub role: Role,
    pub rate_limit: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parse_roundtrip() {
        for role in [
            Role::Admin,
            Role::JobManager,
            Role::JobWriter,
            Role::JobReader,
        ] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("editor"), None);
        assert_eq!(Role::parse("ADMIN"), None);
    }

    #[test]
    fn test_default_rate_limits_follow_role_breadth() {
        assert_eq!(Role::Admin.default_rate_limit(), 1000);
        assert_eq!(Role::JobManager.default_rate_limit(), 500);
        assert_eq!(Role::JobWriter.default_rate_limit(), 100);
        assert_eq!(Role::JobReader.default_rate_limit(), 50);
    }
}
