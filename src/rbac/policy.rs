//! Rank-based policy engine.
//!
//! # Rules
//!
//! - A resource that belongs to a tenant is only reachable from that tenant,
//!   whatever the principal's rank.
//! - A principal without a role is denied everything.
//! - Otherwise an action is allowed iff the principal's rank is at least the
//!   required rank for `(action, resource kind)`.
//! - Administrative actions always require the top rank of the catalogue.
//!
//! Role changes and user removals additionally refuse to leave a tenant
//! without a top-rank user. The check and the write happen under a
//! per-tenant lock.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use rbac_core::{Action, Rank, ResourceKind, Role};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::RbacError;
use super::cache::{Catalogue, RoleCache};
use super::store::UserRecord;

/// The authenticated caller of one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    /// User id.
    pub user_id: String,
    /// Tenant the caller authenticated in.
    pub tenant_id: String,
    /// Role assigned in that tenant.
    pub role: Option<Role>,
}

impl Principal {
    /// Rank of the assigned role.
    #[must_use]
    pub fn rank(&self) -> Option<Rank> {
        self.role.as_ref().map(|r| r.rank)
    }
}

/// What an action targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Owning tenant, when the resource is tenant-scoped.
    pub tenant_id: Option<String>,
}

impl ResourceRef {
    /// A resource not bound to a tenant.
    #[must_use]
    pub fn global(kind: ResourceKind) -> Self {
        Self {
            kind,
            tenant_id: None,
        }
    }

    /// A resource owned by `tenant_id`.
    pub fn in_tenant(kind: ResourceKind, tenant_id: impl Into<String>) -> Self {
        Self {
            kind,
            tenant_id: Some(tenant_id.into()),
        }
    }
}

/// Why an action was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DenyReason {
    /// The principal's rank is below the requirement.
    InsufficientRank {
        /// Rank the action needs.
        required: Rank,
        /// Rank the principal holds.
        held: Rank,
    },
    /// The resource belongs to another tenant.
    TenantMismatch,
    /// The principal has no role.
    NoRoleAssigned,
    /// The change would leave the tenant without a top-rank user.
    LastAdminGuard,
}

impl DenyReason {
    /// Stable snake_case name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InsufficientRank { .. } => "insufficient_rank",
            Self::TenantMismatch => "tenant_mismatch",
            Self::NoRoleAssigned => "no_role_assigned",
            Self::LastAdminGuard => "last_admin_guard",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientRank { required, held } => {
                write!(f, "insufficient rank: requires {required}, holds {held}")
            }
            other => f.write_str(other.as_str()),
        }
    }
}

/// Outcome of an authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Go ahead.
    Allowed,
    /// Refused.
    Denied(DenyReason),
}

impl Decision {
    /// Whether the action may proceed.
    #[must_use]
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Evaluates authorization decisions and guards role mutations.
pub struct PolicyEngine {
    roles: Arc<RoleCache>,
    tenant_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl PolicyEngine {
    /// Create an engine over a role cache.
    #[must_use]
    pub fn new(roles: Arc<RoleCache>) -> Self {
        Self {
            roles,
            tenant_locks: DashMap::new(),
        }
    }

    /// The role cache.
    #[must_use]
    pub fn roles(&self) -> &Arc<RoleCache> {
        &self.roles
    }

    /// Resolve the principal for `user_id` authenticated in `tenant_id`.
    ///
    /// A role recorded under a different tenant is not carried over.
    pub async fn principal(&self, user_id: &str, tenant_id: &str) -> Result<Principal, RbacError> {
        let role = match self.roles.assignment(user_id).await? {
            Some(assignment) if assignment.tenant_id == tenant_id => assignment.role,
            Some(assignment) => {
                debug!(
                    user = %user_id,
                    token_tenant = %tenant_id,
                    record_tenant = %assignment.tenant_id,
                    "Role recorded under another tenant, ignoring"
                );
                None
            }
            None => None,
        };
        Ok(Principal {
            user_id: user_id.to_string(),
            tenant_id: tenant_id.to_string(),
            role,
        })
    }

    /// Decide whether `principal` may perform `action` on `resource`.
    pub async fn authorize(
        &self,
        principal: &Principal,
        action: Action,
        resource: &ResourceRef,
    ) -> Result<Decision, RbacError> {
        if resource
            .tenant_id
            .as_ref()
            .is_some_and(|t| *t != principal.tenant_id)
        {
            return Ok(Decision::Denied(DenyReason::TenantMismatch));
        }
        let Some(held) = principal.rank() else {
            return Ok(Decision::Denied(DenyReason::NoRoleAssigned));
        };

        let catalogue = self.roles.catalogue().await?;
        let required = required_rank(&catalogue, action, resource.kind);
        let decision = if held >= required {
            Decision::Allowed
        } else {
            Decision::Denied(DenyReason::InsufficientRank { required, held })
        };

        debug!(
            user = %principal.user_id,
            action = %action,
            resource = %resource.kind,
            required,
            held,
            allowed = decision.is_allowed(),
            "Authorization decision"
        );
        Ok(decision)
    }

    /// Assign `role` (id or name) to `target_user` on behalf of `actor`.
    ///
    /// A user not yet known is created in the actor's tenant.
    pub async fn change_role(
        &self,
        actor: &Principal,
        target_user: &str,
        role: &str,
    ) -> Result<Decision, RbacError> {
        let lock = self.tenant_lock(&actor.tenant_id);
        let _guard = lock.lock().await;

        let decision = self.authorize_management(actor, ResourceKind::User).await?;
        if !decision.is_allowed() {
            return Ok(decision);
        }

        let catalogue = self.roles.catalogue().await?;
        let new_role = catalogue
            .find(role)
            .cloned()
            .ok_or_else(|| RbacError::UnknownRole(role.to_string()))?;

        let store = self.roles.store();
        let target = self.roles.bounded(store.get_user(target_user)).await?;
        if let Some(ref record) = target {
            if record.tenant_id != actor.tenant_id {
                return Ok(Decision::Denied(DenyReason::TenantMismatch));
            }
            if new_role.rank < catalogue.top_rank
                && self.is_last_top_rank_user(&catalogue, record).await?
            {
                return Ok(Decision::Denied(DenyReason::LastAdminGuard));
            }
        }

        self.roles
            .bounded(store.set_role(target_user, &actor.tenant_id, &new_role.id))
            .await?;
        self.roles.invalidate(target_user);
        info!(
            actor = %actor.user_id,
            user = %target_user,
            tenant = %actor.tenant_id,
            role = %new_role.name,
            "Role changed"
        );
        Ok(Decision::Allowed)
    }

    /// Remove `target_user` from the actor's tenant.
    pub async fn remove_user(
        &self,
        actor: &Principal,
        target_user: &str,
    ) -> Result<Decision, RbacError> {
        let lock = self.tenant_lock(&actor.tenant_id);
        let _guard = lock.lock().await;

        let decision = self.authorize_management(actor, ResourceKind::User).await?;
        if !decision.is_allowed() {
            return Ok(decision);
        }

        let catalogue = self.roles.catalogue().await?;
        let store = self.roles.store();
        let record = self
            .roles
            .bounded(store.get_user(target_user))
            .await?
            .ok_or_else(|| RbacError::UnknownUser(target_user.to_string()))?;
        if record.tenant_id != actor.tenant_id {
            return Ok(Decision::Denied(DenyReason::TenantMismatch));
        }
        if self.is_last_top_rank_user(&catalogue, &record).await? {
            return Ok(Decision::Denied(DenyReason::LastAdminGuard));
        }

        self.roles.bounded(store.remove_user(target_user)).await?;
        self.roles.invalidate(target_user);
        info!(
            actor = %actor.user_id,
            user = %target_user,
            tenant = %actor.tenant_id,
            "User removed"
        );
        Ok(Decision::Allowed)
    }

    /// Add `user_id` to the actor's tenant, optionally with `role` (id or
    /// name).
    pub async fn add_user(
        &self,
        actor: &Principal,
        user_id: &str,
        role: Option<&str>,
    ) -> Result<Decision, RbacError> {
        let lock = self.tenant_lock(&actor.tenant_id);
        let _guard = lock.lock().await;

        let decision = self.authorize_management(actor, ResourceKind::User).await?;
        if !decision.is_allowed() {
            return Ok(decision);
        }

        let catalogue = self.roles.catalogue().await?;
        let role = role
            .map(|r| {
                catalogue
                    .find(r)
                    .cloned()
                    .ok_or_else(|| RbacError::UnknownRole(r.to_string()))
            })
            .transpose()?;

        let store = self.roles.store();
        self.roles
            .bounded(store.create_user(user_id, &actor.tenant_id))
            .await?;
        if let Some(ref role) = role {
            self.roles
                .bounded(store.set_role(user_id, &actor.tenant_id, &role.id))
                .await?;
        }
        self.roles.invalidate(user_id);
        info!(
            actor = %actor.user_id,
            user = %user_id,
            tenant = %actor.tenant_id,
            role = role.as_ref().map_or("-", |r| r.name.as_str()),
            "User added"
        );
        Ok(Decision::Allowed)
    }

    /// Add `role` to the catalogue on behalf of `actor`.
    ///
    /// The rank must lie between 1 and the current top rank, so a new role
    /// never outranks the existing administrators.
    pub async fn create_role(&self, actor: &Principal, role: Role) -> Result<Decision, RbacError> {
        let lock = self.tenant_lock(&actor.tenant_id);
        let _guard = lock.lock().await;

        let decision = self.authorize_management(actor, ResourceKind::Role).await?;
        if !decision.is_allowed() {
            return Ok(decision);
        }

        if role.id.trim().is_empty() || role.name.trim().is_empty() {
            return Err(RbacError::InvalidRole("id and name must not be empty".into()));
        }
        let catalogue = self.roles.catalogue().await?;
        if role.rank == 0 || role.rank > catalogue.top_rank {
            return Err(RbacError::InvalidRole(format!(
                "rank must be between 1 and {}",
                catalogue.top_rank
            )));
        }

        let store = self.roles.store();
        let (id, rank) = (role.id.clone(), role.rank);
        self.roles.bounded(store.create_role(role)).await?;
        self.roles.invalidate_all();
        info!(actor = %actor.user_id, role = %id, rank, "Role created");
        Ok(Decision::Allowed)
    }

    /// Check the actor's current role straight from the store. Must run
    /// under the tenant lock: the principal may predate a concurrent change.
    async fn authorize_management(
        &self,
        actor: &Principal,
        kind: ResourceKind,
    ) -> Result<Decision, RbacError> {
        let store = self.roles.store();
        let role = match self.roles.bounded(store.get_user(&actor.user_id)).await? {
            Some(record) if record.tenant_id == actor.tenant_id => {
                self.roles.bounded(store.get_role(&actor.user_id)).await?
            }
            _ => None,
        };
        if role.as_ref().map(|r| r.rank) != actor.rank() {
            debug!(user = %actor.user_id, "Actor role changed since authentication");
        }
        let current = Principal {
            role,
            ..actor.clone()
        };
        self.authorize(
            &current,
            Action::ManageUsers,
            &ResourceRef::in_tenant(kind, actor.tenant_id.clone()),
        )
        .await
    }

    /// Whether `record` holds the top rank and nobody else in its tenant does.
    async fn is_last_top_rank_user(
        &self,
        catalogue: &Catalogue,
        record: &UserRecord,
    ) -> Result<bool, RbacError> {
        let is_top = |r: &UserRecord| {
            r.role_id
                .as_deref()
                .and_then(|id| catalogue.rank_of(id))
                .is_some_and(|rank| rank >= catalogue.top_rank)
        };
        if !is_top(record) {
            return Ok(false);
        }
        let store = self.roles.store();
        let users = self
            .roles
            .bounded(store.tenant_users(&record.tenant_id))
            .await?;
        Ok(!users
            .iter()
            .any(|u| u.user_id != record.user_id && is_top(u)))
    }

    fn tenant_lock(&self, tenant_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.tenant_locks
                .entry(tenant_id.to_string())
                .or_default()
                .value(),
        )
    }
}

/// Rank needed for `action` on `kind`. Administrative actions never need less
/// than the top rank.
fn required_rank(catalogue: &Catalogue, action: Action, kind: ResourceKind) -> Rank {
    let configured = catalogue.requirements.required_rank(action, kind);
    if action.is_administrative() {
        configured.max(catalogue.top_rank)
    } else {
        configured
    }
}
