pub mod authenticator;
pub mod models;
pub mod rbac;

pub use authenticator::Authenticator;
pub use models::{Identity, Role};
pub use rbac::{list_scope, Authorizer, JobScope, Operation};
