//! HTTP router and handlers
//!
//! # Endpoints
//!
//! | Method | Path | Auth | Description |
//! |--------|------|------|-------------|
//! | `POST` | `/auth/exchange` | none | Exchange an external token for an internal session |
//! | `GET` | `/auth/me` | session | Caller identity, role and session expiry |
//! | `GET` | `/rbac/assignments` | external bearer | Role assignments, listed on behalf of the caller |
//! | `GET` | `/users` | session | Members of the caller's tenant and their roles |
//! | `POST` | `/users` | session, top rank | Add a user to the caller's tenant |
//! | `PUT` | `/users/{user_id}/role` | session, top rank | Change a user's role |
//! | `DELETE` | `/users/{user_id}` | session, top rank | Remove a user |
//! | `POST` | `/roles` | session, top rank | Add a role to the catalogue |
//! | `GET` | `/health` | none | Liveness |
//!
//! ## Token Exchange
//!
//! ```json
//! { "external_token": "<identity provider access token>" }
//! ```
//!
//! `azure_token` is accepted as an alias of `external_token`.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{delete, get, post, put},
};
use chrono::{DateTime, Utc};
use rbac_core::{Rank, Role};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

use super::GatewayError;
use super::auth::{ExternalBearer, session_middleware};
use super::management::RoleAssignment;
use super::service::{Authenticated, Gateway, TenantUser};

/// Token exchange request body
#[derive(Debug, Deserialize)]
pub struct ExchangeRequest {
    /// External access token
    #[serde(alias = "azure_token")]
    pub external_token: String,
}

/// Token exchange response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ExchangeResponse {
    /// Internal session token
    pub access_token: String,
    /// Always `bearer`
    pub token_type: String,
    /// Session lifetime in seconds
    pub expires_in: u64,
    /// User the session belongs to
    pub user_id: String,
    /// Tenant of the user
    pub tenant_id: String,
}

/// `GET /auth/me` response body
#[derive(Debug, Serialize)]
pub struct MeResponse {
    /// User id
    pub user_id: String,
    /// Tenant id
    pub tenant_id: String,
    /// Role in the tenant
    pub role: Option<Role>,
    /// Display name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// User principal name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upn: Option<String>,
    /// Session id
    pub session_id: String,
    /// Session expiry
    pub expires_at: DateTime<Utc>,
}

/// Role change request body
#[derive(Debug, Deserialize)]
pub struct RoleChangeRequest {
    /// Role id or name
    pub role: String,
}

/// `POST /users` request body
#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    /// User id (identity provider object id)
    pub user_id: String,
    /// Role id or name
    #[serde(default)]
    pub role: Option<String>,
}

/// `POST /roles` request body
#[derive(Debug, Deserialize)]
pub struct CreateRoleRequest {
    /// Role id
    pub id: String,
    /// Display name
    pub name: String,
    /// Position in the hierarchy
    pub rank: Rank,
}

/// Create the router
pub fn create_router(gateway: Arc<Gateway>, request_timeout: Duration) -> Router {
    let protected = Router::new()
        .route("/auth/me", get(me_handler))
        .route("/users", get(list_users_handler).post(create_user_handler))
        .route("/roles", post(create_role_handler))
        .route("/users/{user_id}/role", put(change_role_handler))
        .route("/users/{user_id}", delete(remove_user_handler))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&gateway),
            session_middleware,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .route("/auth/exchange", post(exchange_handler))
        .route("/rbac/assignments", get(assignments_handler))
        .merge(protected)
        .layer(CatchPanicLayer::new())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(gateway)
}

/// GET /health
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// POST /auth/exchange
async fn exchange_handler(
    State(gateway): State<Arc<Gateway>>,
    body: Result<Json<ExchangeRequest>, JsonRejection>,
) -> Result<Json<ExchangeResponse>, GatewayError> {
    let Json(request) = body.map_err(|e| GatewayError::BadRequest(e.body_text()))?;
    if request.external_token.trim().is_empty() {
        return Err(GatewayError::BadRequest("external_token is empty".into()));
    }

    let session = gateway.exchange(request.external_token.trim()).await?;
    info!(user = %session.user_id, tenant = %session.tenant_id, "Session issued");

    Ok(Json(ExchangeResponse {
        expires_in: session.expires_in(),
        access_token: session.token,
        token_type: "bearer".to_string(),
        user_id: session.user_id,
        tenant_id: session.tenant_id,
    }))
}

/// GET /auth/me
async fn me_handler(caller: Authenticated) -> Json<MeResponse> {
    let Authenticated { principal, session } = caller;
    Json(MeResponse {
        user_id: principal.user_id,
        tenant_id: principal.tenant_id,
        role: principal.role,
        name: session.name,
        upn: session.upn,
        session_id: session.session_id,
        expires_at: session.expires_at,
    })
}

/// GET /rbac/assignments
async fn assignments_handler(
    State(gateway): State<Arc<Gateway>>,
    ExternalBearer(token): ExternalBearer,
) -> Result<Json<Vec<RoleAssignment>>, GatewayError> {
    gateway.list_role_assignments(token).await.map(Json)
}

/// PUT /users/{user_id}/role
async fn change_role_handler(
    State(gateway): State<Arc<Gateway>>,
    caller: Authenticated,
    Path(user_id): Path<String>,
    body: Result<Json<RoleChangeRequest>, JsonRejection>,
) -> Result<impl IntoResponse, GatewayError> {
    let Json(request) = body.map_err(|e| GatewayError::BadRequest(e.body_text()))?;
    gateway
        .change_role(&caller.principal, &user_id, &request.role)
        .await?;
    Ok(Json(json!({"user_id": user_id, "role": request.role})))
}

/// DELETE /users/{user_id}
async fn remove_user_handler(
    State(gateway): State<Arc<Gateway>>,
    caller: Authenticated,
    Path(user_id): Path<String>,
) -> Result<StatusCode, GatewayError> {
    gateway.remove_user(&caller.principal, &user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /users
async fn list_users_handler(
    State(gateway): State<Arc<Gateway>>,
    caller: Authenticated,
) -> Result<Json<Vec<TenantUser>>, GatewayError> {
    gateway.list_users(&caller).await.map(Json)
}

/// POST /users
async fn create_user_handler(
    State(gateway): State<Arc<Gateway>>,
    caller: Authenticated,
    body: Result<Json<CreateUserRequest>, JsonRejection>,
) -> Result<impl IntoResponse, GatewayError> {
    let Json(request) = body.map_err(|e| GatewayError::BadRequest(e.body_text()))?;
    let user_id = request.user_id.trim();
    if user_id.is_empty() {
        return Err(GatewayError::BadRequest("user_id is empty".into()));
    }
    gateway
        .add_user(&caller.principal, user_id, request.role.as_deref())
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "user_id": user_id,
            "tenant_id": caller.principal.tenant_id,
            "role": request.role,
        })),
    ))
}

/// POST /roles
async fn create_role_handler(
    State(gateway): State<Arc<Gateway>>,
    caller: Authenticated,
    body: Result<Json<CreateRoleRequest>, JsonRejection>,
) -> Result<impl IntoResponse, GatewayError> {
    let Json(request) = body.map_err(|e| GatewayError::BadRequest(e.body_text()))?;
    let role = Role::new(request.id.trim(), request.name.trim(), request.rank);
    gateway.create_role(&caller.principal, role.clone()).await?;
    Ok((StatusCode::CREATED, Json(role)))
}
