//! Authentication middleware for internal session tokens
//!
//! Extracts `Authorization: Bearer <token>`, verifies it as an internal
//! session and injects [`Authenticated`] into the request extensions for the
//! handlers. Missing or invalid tokens get `401` with a bearer challenge.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{FromRequestParts, State},
    http::{Request, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

use super::GatewayError;
use super::service::{Authenticated, Gateway};
use crate::identity::ValidationError;

/// The bearer token of `headers`, if any.
pub fn bearer_token(headers: &axum::http::HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.strip_prefix("Bearer ")
                .or_else(|| v.strip_prefix("bearer "))
        })
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn missing_token() -> GatewayError {
    GatewayError::Unauthenticated(ValidationError::Malformed(
        "missing Authorization header".into(),
    ))
}

/// Session authentication middleware
pub async fn session_middleware(
    State(gateway): State<Arc<Gateway>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let Some(token) = bearer_token(request.headers()) else {
        warn!(path = %path, "Missing Authorization header");
        return missing_token().into_response();
    };

    match gateway.authenticate(token).await {
        Ok(authenticated) => {
            debug!(
                user = %authenticated.principal.user_id,
                tenant = %authenticated.principal.tenant_id,
                path = %path,
                "Authenticated request"
            );
            request.extensions_mut().insert(authenticated);
            next.run(request).await
        }
        Err(e) => {
            warn!(path = %path, "Invalid session token");
            e.into_response()
        }
    }
}

/// The raw bearer token of a request that carries an external token.
pub struct ExternalBearer(pub String);

impl<S: Send + Sync> FromRequestParts<S> for ExternalBearer {
    type Rejection = GatewayError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        bearer_token(&parts.headers)
            .map(|t| Self(t.to_string()))
            .ok_or_else(missing_token)
    }
}

impl<S: Send + Sync> FromRequestParts<S> for Authenticated {
    type Rejection = GatewayError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Self>()
            .cloned()
            .ok_or_else(missing_token)
    }
}
