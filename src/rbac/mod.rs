//! Rank-based access control: role store, role cache and policy engine.

pub mod cache;
pub mod policy;
pub mod store;

pub use cache::{Assignment, Catalogue, RoleCache};
pub use policy::{Decision, DenyReason, PolicyEngine, Principal, ResourceRef};
pub use store::{InMemoryRoleStore, RoleStore, UserRecord};

/// Role store and policy engine failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RbacError {
    /// The role store did not answer in time or failed.
    #[error("Role store unavailable: {0}")]
    Unavailable(String),

    /// No role with this id or name exists.
    #[error("Unknown role: {0}")]
    UnknownRole(String),

    /// No user with this id exists.
    #[error("Unknown user: {0}")]
    UnknownUser(String),

    /// A user with this id already exists.
    #[error("User already exists: {0}")]
    UserExists(String),

    /// A role with this id or name already exists.
    #[error("Role already exists: {0}")]
    RoleExists(String),

    /// The role definition is not acceptable.
    #[error("Invalid role: {0}")]
    InvalidRole(String),
}
