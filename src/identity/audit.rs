//! Audit events for sessions, delegation and authorization decisions.
//!
//! Tokens never appear in audit records. Where a token has to be correlated
//! across records its SHA-256 [`fingerprint`] is used instead.

use serde::Serialize;
use sha2::{Digest, Sha256};

use super::external::ValidationError;
use super::obo::ExchangeError;
use super::session::InternalSession;

/// A structured audit event.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    /// Event type: `session.issued`, `session.rejected`, `access.denied`,
    /// `delegation.issued`, `delegation.failed`, `role.changed`,
    /// `user.added`, `user.removed`, `role.created`, `role.change_denied`.
    pub event: &'static str,
    /// User the event is about.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Tenant the event happened in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// User who performed an administrative change.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Internal session id (`jti`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Fingerprint of the presented token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_fingerprint: Option<String>,
    /// Attempted action.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Targeted resource kind or delegated scope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    /// Machine-readable reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    fn new(event: &'static str) -> Self {
        Self {
            event,
            user_id: None,
            tenant_id: None,
            actor: None,
            session_id: None,
            token_fingerprint: None,
            action: None,
            resource: None,
            reason: None,
        }
    }

    /// An internal session was issued in exchange for an external token.
    #[must_use]
    pub fn session_issued(session: &InternalSession) -> Self {
        Self {
            user_id: Some(session.user_id.clone()),
            tenant_id: Some(session.tenant_id.clone()),
            session_id: Some(session.session_id.clone()),
            token_fingerprint: Some(fingerprint(&session.token)),
            ..Self::new("session.issued")
        }
    }

    /// A presented token (external or internal) was rejected.
    #[must_use]
    pub fn token_rejected(raw_token: &str, error: &ValidationError) -> Self {
        Self {
            token_fingerprint: Some(fingerprint(raw_token)),
            reason: Some(error.kind().to_string()),
            ..Self::new("session.rejected")
        }
    }

    /// An authenticated principal was denied an action.
    #[must_use]
    pub fn access_denied(
        user_id: &str,
        tenant_id: &str,
        action: &str,
        resource: &str,
        reason: &str,
    ) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            tenant_id: Some(tenant_id.to_string()),
            action: Some(action.to_string()),
            resource: Some(resource.to_string()),
            reason: Some(reason.to_string()),
            ..Self::new("access.denied")
        }
    }

    /// A delegated token was obtained.
    #[must_use]
    pub fn delegation_issued(user_id: &str, tenant_id: &str, scope: &str) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            tenant_id: Some(tenant_id.to_string()),
            resource: Some(scope.to_string()),
            ..Self::new("delegation.issued")
        }
    }

    /// Delegation failed.
    #[must_use]
    pub fn delegation_failed(
        user_id: &str,
        tenant_id: &str,
        scope: &str,
        error: &ExchangeError,
    ) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            tenant_id: Some(tenant_id.to_string()),
            resource: Some(scope.to_string()),
            reason: Some(error.kind().to_string()),
            ..Self::new("delegation.failed")
        }
    }

    /// A user's role was changed.
    #[must_use]
    pub fn role_changed(actor: &str, user_id: &str, tenant_id: &str, role: &str) -> Self {
        Self {
            actor: Some(actor.to_string()),
            user_id: Some(user_id.to_string()),
            tenant_id: Some(tenant_id.to_string()),
            resource: Some(role.to_string()),
            ..Self::new("role.changed")
        }
    }

    /// A user was removed from a tenant.
    #[must_use]
    pub fn user_removed(actor: &str, user_id: &str, tenant_id: &str) -> Self {
        Self {
            actor: Some(actor.to_string()),
            user_id: Some(user_id.to_string()),
            tenant_id: Some(tenant_id.to_string()),
            ..Self::new("user.removed")
        }
    }

    /// A user was added to a tenant.
    #[must_use]
    pub fn user_added(actor: &str, user_id: &str, tenant_id: &str, role: Option<&str>) -> Self {
        Self {
            actor: Some(actor.to_string()),
            user_id: Some(user_id.to_string()),
            tenant_id: Some(tenant_id.to_string()),
            resource: role.map(str::to_string),
            ..Self::new("user.added")
        }
    }

    /// A role was added to the catalogue.
    #[must_use]
    pub fn role_created(actor: &str, tenant_id: &str, role: &str) -> Self {
        Self {
            actor: Some(actor.to_string()),
            tenant_id: Some(tenant_id.to_string()),
            resource: Some(role.to_string()),
            ..Self::new("role.created")
        }
    }

    /// A user-management change was refused.
    #[must_use]
    pub fn role_change_denied(actor: &str, user_id: &str, tenant_id: &str, reason: &str) -> Self {
        Self {
            actor: Some(actor.to_string()),
            user_id: Some(user_id.to_string()),
            tenant_id: Some(tenant_id.to_string()),
            reason: Some(reason.to_string()),
            ..Self::new("role.change_denied")
        }
    }
}

/// Short SHA-256 fingerprint of a token: the first 8 bytes, hex encoded.
#[must_use]
pub fn fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(&digest[..8])
}

/// Emit an audit event via `tracing::info!` with the event serialized in the
/// `audit` field:
///
/// ```text
/// INFO rbac_gateway::identity::audit audit={"event":"session.issued",...}
/// ```
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(audit = %json, event = event.event, "audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}
