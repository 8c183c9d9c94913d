//! Role store: users, their role assignment and the rank catalogue.
//!
//! The [`RoleStore`] trait abstracts over storage backends. The bundled
//! implementation is [`InMemoryRoleStore`], seeded from configuration.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use rbac_core::{RankRequirement, RankRequirements, Role};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::RbacError;
use crate::config::RbacConfig;
use crate::{Error, Result};

/// A user's assignment row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// User id (identity provider object id).
    pub user_id: String,
    /// Tenant the user belongs to.
    pub tenant_id: String,
    /// Assigned role id; `None` grants nothing.
    pub role_id: Option<String>,
}

/// Source of role data.
///
/// Implementations must be `Send + Sync` because the store is shared across
/// request tasks.
#[async_trait]
pub trait RoleStore: Send + Sync + 'static {
    /// Role assigned to `user_id`, `None` when the user or the assignment is
    /// missing.
    async fn get_role(&self, user_id: &str) -> std::result::Result<Option<Role>, RbacError>;

    /// Per `(action, resource kind)` rank overrides.
    async fn rank_requirements(&self) -> std::result::Result<RankRequirements, RbacError>;

    /// The role catalogue.
    async fn roles(&self) -> std::result::Result<Vec<Role>, RbacError>;

    /// Assignment row of `user_id`.
    async fn get_user(&self, user_id: &str) -> std::result::Result<Option<UserRecord>, RbacError>;

    /// Every user of `tenant_id`.
    async fn tenant_users(&self, tenant_id: &str)
    -> std::result::Result<Vec<UserRecord>, RbacError>;

    /// Assign `role_id` to `user_id` in `tenant_id`, creating the user if
    /// needed.
    async fn set_role(
        &self,
        user_id: &str,
        tenant_id: &str,
        role_id: &str,
    ) -> std::result::Result<(), RbacError>;

    /// Delete `user_id`. Returns `true` if the user existed.
    async fn remove_user(&self, user_id: &str) -> std::result::Result<bool, RbacError>;

    /// Add `user_id` to `tenant_id` without a role.
    async fn create_user(&self, user_id: &str, tenant_id: &str)
    -> std::result::Result<(), RbacError>;

    /// Add a role to the catalogue. Ids and names are unique.
    async fn create_role(&self, role: Role) -> std::result::Result<(), RbacError>;
}

/// Role store held in memory.
pub struct InMemoryRoleStore {
    roles: RwLock<Vec<Role>>,
    requirements: RankRequirements,
    users: RwLock<HashMap<String, UserRecord>>,
}

impl InMemoryRoleStore {
    /// Empty store over a role catalogue.
    #[must_use]
    pub fn new(roles: Vec<Role>, requirements: &[RankRequirement]) -> Self {
        Self {
            roles: RwLock::new(roles),
            requirements: RankRequirements::from_rows(requirements),
            users: RwLock::new(HashMap::new()),
        }
    }

    /// Store seeded with the configured catalogue and assignments. Role
    /// references may use the role id or its name (case-insensitive).
    pub fn from_config(config: &RbacConfig) -> Result<Self> {
        let store = Self::new(config.roles.clone(), &config.requirements);
        {
            let mut users = store.users.write();
            for user in &config.users {
                let role_id = match user.role {
                    Some(ref wanted) => Some(
                        store
                            .find_role(wanted)
                            .map(|r| r.id)
                            .ok_or_else(|| Error::Config(format!("unknown role {wanted}")))?,
                    ),
                    None => None,
                };
                users.insert(
                    user.user_id.clone(),
                    UserRecord {
                        user_id: user.user_id.clone(),
                        tenant_id: user.tenant_id.clone(),
                        role_id,
                    },
                );
            }
        }
        debug!(
            roles = store.roles.read().len(),
            users = store.users.read().len(),
            "Role store seeded"
        );
        Ok(store)
    }

    /// Insert or replace a user row.
    pub fn upsert(&self, record: UserRecord) {
        self.users.write().insert(record.user_id.clone(), record);
    }

    /// Role by id, or by name ignoring case.
    #[must_use]
    pub fn find_role(&self, id_or_name: &str) -> Option<Role> {
        let roles = self.roles.read();
        roles
            .iter()
            .find(|r| r.id == id_or_name)
            .or_else(|| roles.iter().find(|r| r.name.eq_ignore_ascii_case(id_or_name)))
            .cloned()
    }
}

#[async_trait]
impl RoleStore for InMemoryRoleStore {
    async fn get_role(&self, user_id: &str) -> std::result::Result<Option<Role>, RbacError> {
        let role_id = self
            .users
            .read()
            .get(user_id)
            .and_then(|u| u.role_id.clone());
        Ok(role_id.and_then(|id| self.roles.read().iter().find(|r| r.id == id).cloned()))
    }

    async fn rank_requirements(&self) -> std::result::Result<RankRequirements, RbacError> {
        Ok(self.requirements.clone())
    }

    async fn roles(&self) -> std::result::Result<Vec<Role>, RbacError> {
        Ok(self.roles.read().clone())
    }

    async fn get_user(&self, user_id: &str) -> std::result::Result<Option<UserRecord>, RbacError> {
        Ok(self.users.read().get(user_id).cloned())
    }

    async fn tenant_users(
        &self,
        tenant_id: &str,
    ) -> std::result::Result<Vec<UserRecord>, RbacError> {
        let mut users: Vec<UserRecord> = self
            .users
            .read()
            .values()
            .filter(|u| u.tenant_id == tenant_id)
            .cloned()
            .collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(users)
    }

    async fn set_role(
        &self,
        user_id: &str,
        tenant_id: &str,
        role_id: &str,
    ) -> std::result::Result<(), RbacError> {
        if !self.roles.read().iter().any(|r| r.id == role_id) {
            return Err(RbacError::UnknownRole(role_id.to_string()));
        }
        self.upsert(UserRecord {
            user_id: user_id.to_string(),
            tenant_id: tenant_id.to_string(),
            role_id: Some(role_id.to_string()),
        });
        Ok(())
    }

    async fn remove_user(&self, user_id: &str) -> std::result::Result<bool, RbacError> {
        Ok(self.users.write().remove(user_id).is_some())
    }

    async fn create_user(
        &self,
        user_id: &str,
        tenant_id: &str,
    ) -> std::result::Result<(), RbacError> {
        let mut users = self.users.write();
        if users.contains_key(user_id) {
            return Err(RbacError::UserExists(user_id.to_string()));
        }
        users.insert(
            user_id.to_string(),
            UserRecord {
                user_id: user_id.to_string(),
                tenant_id: tenant_id.to_string(),
                role_id: None,
            },
        );
        Ok(())
    }

    async fn create_role(&self, role: Role) -> std::result::Result<(), RbacError> {
        let mut roles = self.roles.write();
        if roles
            .iter()
            .any(|r| r.id == role.id || r.name.eq_ignore_ascii_case(&role.name))
        {
            return Err(RbacError::RoleExists(role.id));
        }
        debug!(role = %role.id, rank = role.rank, "Role added");
        roles.push(role);
        Ok(())
    }
}
