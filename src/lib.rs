//! RBAC Gateway Library
//!
//! Token exchange and rank-based access control in front of a multi-tenant
//! API.
//!
//! # Features
//!
//! - **Token exchange**: identity provider access tokens are validated
//!   against cached JWKS keys and exchanged for short-lived internal sessions
//! - **Rank-based RBAC**: tenant isolation, per-action rank overrides and a
//!   guard that keeps every tenant administered
//! - **On-behalf-of delegation**: cached, coalesced downstream tokens for the
//!   resource-management API
//! - **Audit trail**: structured records for every issuance, rejection and
//!   role change, with token fingerprints instead of tokens
//!
//! # Modules
//!
//! - [`identity`]: key resolution, external validation, sessions, delegation
//! - [`rbac`]: role store, role cache and policy engine
//! - [`gateway`]: the façade and its HTTP routes

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod rbac;
pub mod retry;
pub mod singleflight;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
