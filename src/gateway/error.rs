//! Request-time errors and their HTTP mapping.
//!
//! | Error | Status |
//! |-------|--------|
//! | rejected bearer token | `401` (`503` if keys are unreachable) |
//! | malformed token submitted for exchange | `400` |
//! | policy denial, delegation refused | `403` |
//! | role store, token endpoint or keys down | `503` |
//! | invalid delegated scope, downstream API failure | `502` |
//!
//! Clients get a generic message; the full error is logged.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{error, warn};

use super::management::ManagementError;
use crate::identity::{ExchangeError, IssueError, ValidationError};
use crate::rbac::{DenyReason, RbacError};

/// Any failure of a gateway operation.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The bearer token in `Authorization` was rejected.
    #[error("Authentication failed: {0}")]
    Unauthenticated(ValidationError),

    /// The token submitted for exchange was rejected.
    #[error("Token rejected: {0}")]
    InvalidToken(ValidationError),

    /// No session could be minted.
    #[error("Session issuance failed: {0}")]
    Issue(#[from] IssueError),

    /// The policy engine refused the action.
    #[error("Access denied: {0}")]
    Denied(DenyReason),

    /// On-behalf-of delegation failed.
    #[error("Delegation failed: {0}")]
    Delegation(#[from] ExchangeError),

    /// Role store failure.
    #[error(transparent)]
    Rbac(#[from] RbacError),

    /// The resource-management API failed.
    #[error("Downstream call failed: {0}")]
    Downstream(#[from] ManagementError),

    /// A feature the request needs is not configured.
    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    /// The request itself is invalid.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// A bug: broken lifecycle or similar.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// HTTP status of this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated(ValidationError::KeyResolutionFailed(_))
            | Self::InvalidToken(ValidationError::KeyResolutionFailed(_)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::InvalidToken(ValidationError::Malformed(_)) | Self::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Unauthenticated(_)
            | Self::InvalidToken(_)
            | Self::Issue(IssueError::NoRemainingLifetime) => StatusCode::UNAUTHORIZED,
            Self::Denied(_) | Self::Delegation(ExchangeError::DelegationDenied(_)) => {
                StatusCode::FORBIDDEN
            }
            Self::Delegation(ExchangeError::Unavailable(_))
            | Self::Rbac(RbacError::Unavailable(_))
            | Self::NotConfigured(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Delegation(ExchangeError::InvalidScope(_)) | Self::Downstream(_) => {
                StatusCode::BAD_GATEWAY
            }
            Self::Rbac(RbacError::UnknownRole(_) | RbacError::InvalidRole(_)) => {
                StatusCode::BAD_REQUEST
            }
            Self::Rbac(RbacError::UnknownUser(_)) => StatusCode::NOT_FOUND,
            Self::Rbac(RbacError::UserExists(_) | RbacError::RoleExists(_)) => StatusCode::CONFLICT,
            Self::Issue(IssueError::Signing(_)) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable error code for the response body.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self.status() {
            StatusCode::BAD_REQUEST => "bad_request",
            StatusCode::UNAUTHORIZED => "unauthorized",
            StatusCode::FORBIDDEN => "forbidden",
            StatusCode::NOT_FOUND => "not_found",
            StatusCode::CONFLICT => "conflict",
            StatusCode::BAD_GATEWAY => "bad_gateway",
            StatusCode::SERVICE_UNAVAILABLE => "service_unavailable",
            _ => "internal_error",
        }
    }

    /// What the client is told.
    fn public_message(&self) -> String {
        match self {
            Self::InvalidToken(ValidationError::Malformed(_)) => "Malformed token".into(),
            Self::Unauthenticated(ValidationError::KeyResolutionFailed(_))
            | Self::InvalidToken(ValidationError::KeyResolutionFailed(_)) => {
                "Signing keys are temporarily unavailable".into()
            }
            Self::Unauthenticated(_) | Self::InvalidToken(_) | Self::Issue(IssueError::NoRemainingLifetime) => {
                "Invalid or expired token".into()
            }
            Self::Denied(_) => "Insufficient permissions".into(),
            Self::Delegation(ExchangeError::DelegationDenied(_)) => {
                "Delegation was refused by the identity provider".into()
            }
            Self::Delegation(ExchangeError::Unavailable(_)) | Self::Rbac(RbacError::Unavailable(_)) => {
                "Service temporarily unavailable".into()
            }
            Self::Delegation(ExchangeError::InvalidScope(_)) | Self::Downstream(_) => {
                "Upstream service error".into()
            }
            Self::Rbac(RbacError::UnknownRole(role)) => format!("Unknown role: {role}"),
            Self::Rbac(RbacError::UnknownUser(user)) => format!("Unknown user: {user}"),
            Self::Rbac(RbacError::UserExists(user)) => format!("User already exists: {user}"),
            Self::Rbac(RbacError::RoleExists(role)) => format!("Role already exists: {role}"),
            Self::Rbac(RbacError::InvalidRole(reason)) => format!("Invalid role: {reason}"),
            Self::NotConfigured(what) => format!("{what} is not configured"),
            Self::BadRequest(message) => message.clone(),
            Self::Issue(IssueError::Signing(_)) | Self::Internal(_) => "Internal error".into(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self, "Request failed");
        } else {
            warn!(status = status.as_u16(), error = %self, "Request rejected");
        }

        let mut body = json!({
            "error": self.code(),
            "message": self.public_message(),
        });
        if let Self::Denied(reason) = self {
            body["reason"] = json!(reason.as_str());
        }

        if status == StatusCode::UNAUTHORIZED {
            (status, [("WWW-Authenticate", "Bearer")], Json(body)).into_response()
        } else {
            (status, Json(body)).into_response()
        }
    }
}
