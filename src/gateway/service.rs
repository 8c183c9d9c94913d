//! The gateway façade: every request-time operation, wired together.

use std::collections::HashMap;
use std::sync::Arc;

use rbac_core::{Action, ResourceKind, Role};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::GatewayError;
use super::lifecycle::{Lifecycle, Stage};
use super::management::{ManagementClient, RoleAssignment};
use crate::clock::{SharedClock, SystemClock};
use crate::config::Config;
use crate::identity::audit::{self, AuditEvent};
use crate::identity::{
    DelegatedAccessToken, DelegationArtifact, ExternalClaims, ExternalTokenValidator,
    HttpTokenEndpoint, InternalSession, JwksSource, KeyResolver, KeySource, OboClient,
    SessionIssuer, SessionKeyRing, SessionVerifier, TokenEndpoint, ValidatorSettings,
};
use crate::rbac::{Decision, InMemoryRoleStore, PolicyEngine, Principal, ResourceRef, RoleCache, RoleStore};
use crate::Result;

/// A verified internal session and the principal behind it.
#[derive(Debug, Clone)]
pub struct Authenticated {
    /// Caller identity and role.
    pub principal: Principal,
    /// The verified session.
    pub session: InternalSession,
}

/// A tenant member as listed by `GET /users`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantUser {
    /// User id.
    pub user_id: String,
    /// Tenant id.
    pub tenant_id: String,
    /// Assigned role, if any.
    pub role: Option<Role>,
}

/// Token exchange, session verification, authorization and delegation.
pub struct Gateway {
    validator: ExternalTokenValidator,
    issuer: SessionIssuer,
    verifier: SessionVerifier,
    policy: PolicyEngine,
    obo: Option<OboClient>,
    management: Option<ManagementClient>,
    audience: String,
    issuers: Vec<String>,
}

impl Gateway {
    /// Build a gateway talking to the real identity provider.
    pub fn from_config(config: &Config) -> Result<Self> {
        GatewayBuilder::new(config).build()
    }

    /// The policy engine.
    #[must_use]
    pub fn policy(&self) -> &PolicyEngine {
        &self.policy
    }

    /// The session issuer.
    #[must_use]
    pub fn issuer(&self) -> &SessionIssuer {
        &self.issuer
    }

    /// Exchange an external token for an internal session.
    pub async fn exchange(&self, external_token: &str) -> std::result::Result<InternalSession, GatewayError> {
        let mut lifecycle = Lifecycle::start("exchange");

        let claims = match self
            .validator
            .validate_any(external_token, &self.audience, &self.issuers)
            .await
        {
            Ok(claims) => claims,
            Err(e) => {
                audit::emit(&AuditEvent::token_rejected(external_token, &e));
                lifecycle.reject(e.kind());
                return Err(GatewayError::InvalidToken(e));
            }
        };
        lifecycle.advance(Stage::ExternalValidated)?;

        let session = match self.issuer.issue(&claims) {
            Ok(session) => session,
            Err(e) => {
                lifecycle.reject("issuance_failed");
                return Err(e.into());
            }
        };
        lifecycle.advance(Stage::InternalIssued)?;

        audit::emit(&AuditEvent::session_issued(&session));
        Ok(session)
    }

    /// Verify an internal session token and resolve its principal.
    pub async fn authenticate(&self, internal_token: &str) -> std::result::Result<Authenticated, GatewayError> {
        let mut lifecycle = Lifecycle::start("session");

        let session = match self.verifier.verify(internal_token) {
            Ok(session) => session,
            Err(e) => {
                audit::emit(&AuditEvent::token_rejected(internal_token, &e));
                lifecycle.reject(e.kind());
                return Err(GatewayError::Unauthenticated(e));
            }
        };
        let principal = match self
            .policy
            .principal(&session.user_id, &session.tenant_id)
            .await
        {
            Ok(principal) => principal,
            Err(e) => {
                lifecycle.reject("role_lookup_failed");
                return Err(e.into());
            }
        };
        lifecycle.advance(Stage::InternalValidated)?;
        Ok(Authenticated { principal, session })
    }

    /// Check `action` on `resource` for `principal`.
    pub async fn authorize(
        &self,
        principal: &Principal,
        action: Action,
        resource: &ResourceRef,
    ) -> std::result::Result<(), GatewayError> {
        match self.policy.authorize(principal, action, resource).await? {
            Decision::Allowed => Ok(()),
            Decision::Denied(reason) => {
                audit::emit(&AuditEvent::access_denied(
                    &principal.user_id,
                    &principal.tenant_id,
                    action.as_str(),
                    resource.kind.as_str(),
                    reason.as_str(),
                ));
                Err(GatewayError::Denied(reason))
            }
        }
    }

    /// Check `action` on `resource` for a caller whose session was already
    /// verified.
    pub async fn authorize_session(
        &self,
        caller: &Authenticated,
        action: Action,
        resource: &ResourceRef,
    ) -> std::result::Result<(), GatewayError> {
        let mut lifecycle = Lifecycle::verified("session");
        if let Err(e) = self.authorize(&caller.principal, action, resource).await {
            lifecycle.reject("denied");
            return Err(e);
        }
        lifecycle.advance(Stage::Authorized)
    }

    /// Validate an external bearer token.
    pub async fn validate_external(
        &self,
        external_token: &str,
    ) -> std::result::Result<ExternalClaims, GatewayError> {
        self.validator
            .validate_any(external_token, &self.audience, &self.issuers)
            .await
            .map_err(|e| {
                audit::emit(&AuditEvent::token_rejected(external_token, &e));
                GatewayError::Unauthenticated(e)
            })
    }

    /// Obtain a downstream token for `scope` acting as the token's subject.
    pub async fn delegate(
        &self,
        claims: &ExternalClaims,
        artifact: DelegationArtifact,
        scope: &str,
    ) -> std::result::Result<DelegatedAccessToken, GatewayError> {
        let obo = self
            .obo
            .as_ref()
            .ok_or(GatewayError::NotConfigured("Delegation"))?;

        match obo
            .exchange(&claims.subject, &claims.tenant_id, artifact, scope)
            .await
        {
            Ok(token) => {
                audit::emit(&AuditEvent::delegation_issued(
                    &claims.subject,
                    &claims.tenant_id,
                    scope,
                ));
                Ok(token)
            }
            Err(e) => {
                audit::emit(&AuditEvent::delegation_failed(
                    &claims.subject,
                    &claims.tenant_id,
                    scope,
                    &e,
                ));
                Err(e.into())
            }
        }
    }

    /// List the subscription's role assignments on behalf of the caller.
    ///
    /// The caller presents their external token, needs read access to role
    /// assignments in their tenant, and the listing runs under a delegated
    /// token.
    pub async fn list_role_assignments(
        &self,
        external_token: String,
    ) -> std::result::Result<Vec<RoleAssignment>, GatewayError> {
        let mut lifecycle = Lifecycle::start("delegation");

        let claims = match self.validate_external(&external_token).await {
            Ok(claims) => claims,
            Err(e) => {
                lifecycle.reject("unauthenticated");
                return Err(e);
            }
        };
        lifecycle.advance(Stage::ExternalValidated)?;

        let principal = self
            .policy
            .principal(&claims.subject, &claims.tenant_id)
            .await?;
        let resource = ResourceRef::in_tenant(ResourceKind::RoleAssignment, claims.tenant_id.clone());
        if let Err(e) = self.authorize(&principal, Action::Read, &resource).await {
            lifecycle.reject("denied");
            return Err(e);
        }
        lifecycle.advance(Stage::Authorized)?;

        let management = self
            .management
            .as_ref()
            .ok_or(GatewayError::NotConfigured("Management API"))?;
        let token = self
            .delegate(&claims, DelegationArtifact::new(external_token), management.scope())
            .await?;
        Ok(management.list_role_assignments(&token).await?)
    }

    /// Assign `role` to `target_user` on behalf of `actor`.
    pub async fn change_role(
        &self,
        actor: &Principal,
        target_user: &str,
        role: &str,
    ) -> std::result::Result<(), GatewayError> {
        match self.policy.change_role(actor, target_user, role).await? {
            Decision::Allowed => {
                audit::emit(&AuditEvent::role_changed(
                    &actor.user_id,
                    target_user,
                    &actor.tenant_id,
                    role,
                ));
                Ok(())
            }
            Decision::Denied(reason) => {
                audit::emit(&AuditEvent::role_change_denied(
                    &actor.user_id,
                    target_user,
                    &actor.tenant_id,
                    reason.as_str(),
                ));
                Err(GatewayError::Denied(reason))
            }
        }
    }

    /// Members of the caller's tenant with their roles.
    pub async fn list_users(
        &self,
        caller: &Authenticated,
    ) -> std::result::Result<Vec<TenantUser>, GatewayError> {
        let tenant_id = &caller.principal.tenant_id;
        self.authorize_session(
            caller,
            Action::Read,
            &ResourceRef::in_tenant(ResourceKind::User, tenant_id.clone()),
        )
        .await?;

        let roles = self.policy.roles();
        let catalogue = roles.catalogue().await?;
        let records = roles.bounded(roles.store().tenant_users(tenant_id)).await?;
        Ok(records
            .into_iter()
            .map(|record| TenantUser {
                role: record
                    .role_id
                    .as_deref()
                    .and_then(|id| catalogue.roles.iter().find(|r| r.id == id))
                    .cloned(),
                user_id: record.user_id,
                tenant_id: record.tenant_id,
            })
            .collect())
    }

    /// Add `user_id` to the actor's tenant, optionally with `role`.
    pub async fn add_user(
        &self,
        actor: &Principal,
        user_id: &str,
        role: Option<&str>,
    ) -> std::result::Result<(), GatewayError> {
        match self.policy.add_user(actor, user_id, role).await? {
            Decision::Allowed => {
                audit::emit(&AuditEvent::user_added(
                    &actor.user_id,
                    user_id,
                    &actor.tenant_id,
                    role,
                ));
                Ok(())
            }
            Decision::Denied(reason) => {
                audit::emit(&AuditEvent::role_change_denied(
                    &actor.user_id,
                    user_id,
                    &actor.tenant_id,
                    reason.as_str(),
                ));
                Err(GatewayError::Denied(reason))
            }
        }
    }

    /// Add `role` to the catalogue on behalf of `actor`.
    pub async fn create_role(
        &self,
        actor: &Principal,
        role: Role,
    ) -> std::result::Result<(), GatewayError> {
        let role_id = role.id.clone();
        match self.policy.create_role(actor, role).await? {
            Decision::Allowed => {
                audit::emit(&AuditEvent::role_created(
                    &actor.user_id,
                    &actor.tenant_id,
                    &role_id,
                ));
                Ok(())
            }
            Decision::Denied(reason) => {
                audit::emit(&AuditEvent::access_denied(
                    &actor.user_id,
                    &actor.tenant_id,
                    Action::ManageUsers.as_str(),
                    ResourceKind::Role.as_str(),
                    reason.as_str(),
                ));
                Err(GatewayError::Denied(reason))
            }
        }
    }

    /// Remove `target_user` from the actor's tenant.
    pub async fn remove_user(
        &self,
        actor: &Principal,
        target_user: &str,
    ) -> std::result::Result<(), GatewayError> {
        match self.policy.remove_user(actor, target_user).await? {
            Decision::Allowed => {
                if let Some(ref obo) = self.obo {
                    obo.evict_subject(target_user, &actor.tenant_id);
                }
                audit::emit(&AuditEvent::user_removed(
                    &actor.user_id,
                    target_user,
                    &actor.tenant_id,
                ));
                Ok(())
            }
            Decision::Denied(reason) => {
                audit::emit(&AuditEvent::role_change_denied(
                    &actor.user_id,
                    target_user,
                    &actor.tenant_id,
                    reason.as_str(),
                ));
                Err(GatewayError::Denied(reason))
            }
        }
    }
}

/// Assembles a [`Gateway`], with each collaborator replaceable.
///
/// Anything not supplied is built from the configuration: JWKS over HTTPS,
/// the tenant token endpoint (only when a client secret is configured), the
/// management API (only when a subscription is configured) and the
/// in-memory role store.
pub struct GatewayBuilder<'a> {
    config: &'a Config,
    clock: SharedClock,
    key_source: Option<Arc<dyn KeySource>>,
    token_endpoint: Option<Arc<dyn TokenEndpoint>>,
    role_store: Option<Arc<dyn RoleStore>>,
    management: Option<ManagementClient>,
}

impl<'a> GatewayBuilder<'a> {
    /// Start from `config` with the system clock.
    #[must_use]
    pub fn new(config: &'a Config) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            key_source: None,
            token_endpoint: None,
            role_store: None,
            management: None,
        }
    }

    /// Use `clock` everywhere.
    #[must_use]
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Fetch signing keys from `source`.
    #[must_use]
    pub fn key_source(mut self, source: Arc<dyn KeySource>) -> Self {
        self.key_source = Some(source);
        self
    }

    /// Delegate through `endpoint`.
    #[must_use]
    pub fn token_endpoint(mut self, endpoint: Arc<dyn TokenEndpoint>) -> Self {
        self.token_endpoint = Some(endpoint);
        self
    }

    /// Read and write roles through `store`.
    #[must_use]
    pub fn role_store(mut self, store: Arc<dyn RoleStore>) -> Self {
        self.role_store = Some(store);
        self
    }

    /// List role assignments through `client`.
    #[must_use]
    pub fn management(mut self, client: ManagementClient) -> Self {
        self.management = Some(client);
        self
    }

    /// Build the gateway.
    pub fn build(self) -> Result<Gateway> {
        let config = self.config;
        let clock = self.clock;
        let issuers = config.identity.issuers();

        let key_source = match self.key_source {
            Some(source) => source,
            None => {
                let jwks_uri = config.identity.jwks_uri();
                let uris: HashMap<String, String> = issuers
                    .iter()
                    .map(|issuer| (issuer.clone(), jwks_uri.clone()))
                    .collect();
                Arc::new(JwksSource::new(uris, config.keys.fetch_timeout)?)
            }
        };
        let keys = Arc::new(KeyResolver::new(
            key_source,
            Arc::clone(&clock),
            config.keys.clone(),
        ));
        let validator = ExternalTokenValidator::new(
            keys,
            Arc::clone(&clock),
            ValidatorSettings::from(&config.identity),
        );

        let ring = Arc::new(SessionKeyRing::from_config(&config.session)?);
        let issuer = SessionIssuer::new(Arc::clone(&ring), Arc::clone(&clock), &config.session);
        let verifier = SessionVerifier::new(ring, Arc::clone(&clock), &config.session);

        let token_endpoint = match self.token_endpoint {
            Some(endpoint) => Some(endpoint),
            None => match config.identity.resolve_client_secret()? {
                Some(secret) => Some(Arc::new(HttpTokenEndpoint::new(
                    config.identity.token_endpoint(),
                    config.identity.client_id.clone(),
                    secret,
                    config.obo.timeout,
                )?) as Arc<dyn TokenEndpoint>),
                None => {
                    warn!("No client secret configured, delegation disabled");
                    None
                }
            },
        };
        let obo = token_endpoint
            .map(|endpoint| OboClient::new(endpoint, Arc::clone(&clock), &config.obo));

        let management = match self.management {
            Some(client) => Some(client),
            None if config.management.subscription_id.is_empty() => None,
            None => Some(ManagementClient::new(&config.management)?),
        };

        let store = match self.role_store {
            Some(store) => store,
            None => Arc::new(InMemoryRoleStore::from_config(&config.rbac)?),
        };
        let roles = Arc::new(RoleCache::new(
            store,
            Arc::clone(&clock),
            config.rbac.role_cache_ttl,
            config.rbac.lookup_timeout,
        ));

        info!(
            audience = %config.identity.audience(),
            issuers = issuers.len(),
            delegation = obo.is_some(),
            management = management.is_some(),
            "Gateway assembled"
        );

        Ok(Gateway {
            validator,
            issuer,
            verifier,
            policy: PolicyEngine::new(roles),
            obo,
            management,
            audience: config.identity.audience(),
            issuers,
        })
    }
}
