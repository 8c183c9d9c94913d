//! Error types for the RBAC gateway

use std::io;

use thiserror::Error;

/// Result type alias for the RBAC gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Process-level errors: configuration, startup, I/O.
///
/// Request-time failures use the per-stage enums in [`crate::identity`] and
/// [`crate::rbac`], composed by [`crate::gateway::GatewayError`].
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Signing key material could not be loaded
    #[error("Key material error: {0}")]
    KeyMaterial(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}
