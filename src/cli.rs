//! Command-line interface

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rbac_core::{Action, ResourceKind};

/// Token exchange and role-based access control gateway
#[derive(Parser, Debug)]
#[command(name = "rbac-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "RBAC_GATEWAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "RBAC_GATEWAY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "RBAC_GATEWAY_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "RBAC_GATEWAY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "RBAC_GATEWAY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default)
    Serve,

    /// Issue an internal session token for a configured user
    Mint {
        /// User id
        #[arg(required = true)]
        user_id: String,

        /// Tenant id (defaults to the user's configured tenant)
        #[arg(short, long)]
        tenant_id: Option<String>,

        /// Lifetime, e.g. "30m" (capped at session.ttl)
        #[arg(long, value_parser = parse_duration)]
        ttl: Option<Duration>,
    },

    /// Decide whether a configured user may perform an action
    Check {
        /// User id
        user_id: String,

        /// Action: read, write, delete, manage_users
        action: Action,

        /// Resource kind, e.g. dataset, model, role_assignment
        resource: ResourceKind,

        /// Tenant of the resource (defaults to the user's configured tenant)
        #[arg(short, long)]
        tenant_id: Option<String>,
    },

    /// List the role catalogue and the users of a tenant
    Roles {
        /// Only show users of this tenant
        #[arg(short, long)]
        tenant_id: Option<String>,
    },
}

/// Parse "100ms", "30s", "5m", "1h" or bare seconds.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    crate::config::humantime_serde::parse(value.trim()).map_err(|e| format!("invalid duration: {e}"))
}
