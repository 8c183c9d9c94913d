//! Rank-based role primitives.
//!
//! Roles form a total order by [`Role::rank`]: a role with a higher rank holds
//! every permission of each lower-ranked role. Actions carry a default minimum
//! rank which can be overridden per `(action, resource kind)` pair through
//! [`RankRequirements`].

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Integer position of a role in the hierarchy.
pub type Rank = u32;

/// A role as supplied by the user/role store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    /// Stable identifier (the store's primary key).
    pub id: String,
    /// Display name, e.g. `"MAINTAINER"`.
    pub name: String,
    /// Position in the hierarchy.
    pub rank: Rank,
}

impl Role {
    /// Build a role.
    pub fn new(id: impl Into<String>, name: impl Into<String>, rank: Rank) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            rank,
        }
    }
}

/// The default role catalogue: `USER` (1), `MAINTAINER` (2), `ADMIN` (3).
#[must_use]
pub fn default_roles() -> Vec<Role> {
    vec![
        Role::new("user", "USER", 1),
        Role::new("maintainer", "MAINTAINER", 2),
        Role::new("admin", "ADMIN", 3),
    ]
}

/// Highest rank in a catalogue, `None` when the catalogue is empty.
#[must_use]
pub fn top_rank(roles: &[Role]) -> Option<Rank> {
    roles.iter().map(|r| r.rank).max()
}

/// Operation a principal wants to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// List or fetch.
    Read,
    /// Create or update.
    Write,
    /// Delete.
    Delete,
    /// Assign roles, remove users.
    ManageUsers,
}

impl Action {
    /// All actions, in ascending default rank.
    pub const ALL: [Action; 4] = [Self::Read, Self::Write, Self::Delete, Self::ManageUsers];

    /// Minimum rank when no override is configured.
    #[must_use]
    pub fn default_rank(self) -> Rank {
        match self {
            Self::Read | Self::Write => 1,
            Self::Delete => 2,
            Self::ManageUsers => 3,
        }
    }

    /// Administrative actions require exactly the top rank of the catalogue.
    #[must_use]
    pub fn is_administrative(self) -> bool {
        matches!(self, Self::ManageUsers)
    }

    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Delete => "delete",
            Self::ManageUsers => "manage_users",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            "delete" => Ok(Self::Delete),
            "manage_users" | "user_management" => Ok(Self::ManageUsers),
            other => Err(ParseError::new("action", other)),
        }
    }
}

/// Kind of resource an action targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Uploaded training data.
    Dataset,
    /// AutoML experiment.
    Experiment,
    /// Trained model.
    Model,
    /// Experiment run.
    Run,
    /// Online endpoint.
    Endpoint,
    /// Model deployment behind an endpoint.
    Deployment,
    /// User record.
    User,
    /// Role definition.
    Role,
    /// Role assignment in the resource-management API.
    RoleAssignment,
}

impl ResourceKind {
    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dataset => "dataset",
            Self::Experiment => "experiment",
            Self::Model => "model",
            Self::Run => "run",
            Self::Endpoint => "endpoint",
            Self::Deployment => "deployment",
            Self::User => "user",
            Self::Role => "role",
            Self::RoleAssignment => "role_assignment",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dataset" => Ok(Self::Dataset),
            "experiment" => Ok(Self::Experiment),
            "model" => Ok(Self::Model),
            "run" => Ok(Self::Run),
            "endpoint" => Ok(Self::Endpoint),
            "deployment" => Ok(Self::Deployment),
            "user" => Ok(Self::User),
            "role" => Ok(Self::Role),
            "role_assignment" => Ok(Self::RoleAssignment),
            other => Err(ParseError::new("resource kind", other)),
        }
    }
}

/// Unknown action or resource kind name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    what: &'static str,
    value: String,
}

impl ParseError {
    fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_string(),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {}: {}", self.what, self.value)
    }
}

impl std::error::Error for ParseError {}

/// One override row: `action` on `resource` needs at least `rank`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankRequirement {
    /// Action the row applies to.
    pub action: Action,
    /// Resource kind the row applies to.
    pub resource: ResourceKind,
    /// Minimum rank.
    pub rank: Rank,
}

/// Minimum rank per `(action, resource kind)`, falling back to
/// [`Action::default_rank`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RankRequirements {
    overrides: HashMap<(Action, ResourceKind), Rank>,
}

impl RankRequirements {
    /// Build from override rows. Later rows win over earlier ones.
    #[must_use]
    pub fn from_rows(rows: &[RankRequirement]) -> Self {
        let overrides = rows
            .iter()
            .map(|r| ((r.action, r.resource), r.rank))
            .collect();
        Self { overrides }
    }

    /// Minimum rank for `action` on `resource`.
    #[must_use]
    pub fn required_rank(&self, action: Action, resource: ResourceKind) -> Rank {
        self.overrides
            .get(&(action, resource))
            .copied()
            .unwrap_or_else(|| action.default_rank())
    }

    /// Override rows, sorted for stable output.
    #[must_use]
    pub fn rows(&self) -> Vec<RankRequirement> {
        let mut rows: Vec<RankRequirement> = self
            .overrides
            .iter()
            .map(|(&(action, resource), &rank)| RankRequirement {
                action,
                resource,
                rank,
            })
            .collect();
        rows.sort_by_key(|r| (r.action.as_str(), r.resource.as_str()));
        rows
    }
}
