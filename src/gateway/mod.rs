//! Gateway: the façade over identity and RBAC, and its HTTP surface.

pub mod auth;
mod error;
pub mod lifecycle;
pub mod management;
mod router;
mod server;
mod service;

pub use auth::{ExternalBearer, bearer_token, session_middleware};
pub use error::GatewayError;
pub use lifecycle::{Lifecycle, Stage};
pub use management::{ManagementClient, ManagementError, RoleAssignment};
pub use router::{
    CreateRoleRequest, CreateUserRequest, ExchangeRequest, ExchangeResponse, MeResponse,
    RoleChangeRequest, create_router,
};
pub use server::Server;
pub use service::{Authenticated, Gateway, GatewayBuilder, TenantUser};
