//! RBAC Gateway - token exchange and role-based access control

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rbac_core::{Action, ResourceKind};
use tracing::{error, info};

use rbac_gateway::{
    cli::{Cli, Command},
    clock::SystemClock,
    config::Config,
    gateway::Server,
    identity::{SessionIssuer, SessionKeyRing, SessionSubject},
    rbac::{Decision, InMemoryRoleStore, PolicyEngine, ResourceRef, RoleCache, RoleStore},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::Mint {
            user_id,
            tenant_id,
            ttl,
        }) => run_mint(&config, &user_id, tenant_id.as_deref(), ttl).await,
        Some(Command::Check {
            user_id,
            action,
            resource,
            tenant_id,
        }) => run_check(&config, &user_id, action, resource, tenant_id.as_deref()).await,
        Some(Command::Roles { tenant_id }) => run_roles(&config, tenant_id.as_deref()).await,
        Some(Command::Serve) | None => run_server(config, cli.port, cli.host).await,
    }
}

/// Issue an internal session for a configured user
async fn run_mint(
    config: &Config,
    user_id: &str,
    tenant_id: Option<&str>,
    ttl: Option<Duration>,
) -> ExitCode {
    if config.session.signing_keys.is_empty() {
        eprintln!("❌ No session signing keys configured; a minted token could never be verified");
        return ExitCode::FAILURE;
    }

    let store = match InMemoryRoleStore::from_config(&config.rbac) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    };
    let record = store.get_user(user_id).await.ok().flatten();
    let role = store.get_role(user_id).await.ok().flatten();

    let Some(tenant_id) = tenant_id
        .map(str::to_string)
        .or_else(|| record.map(|r| r.tenant_id))
    else {
        eprintln!("❌ User '{user_id}' is not configured; pass --tenant-id");
        return ExitCode::FAILURE;
    };

    let keys = match SessionKeyRing::from_config(&config.session) {
        Ok(keys) => Arc::new(keys),
        Err(e) => {
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    };
    let issuer = SessionIssuer::new(keys, Arc::new(SystemClock), &config.session);

    let mut subject = SessionSubject::new(user_id, tenant_id);
    subject.roles = role.as_ref().map(|r| [r.name.clone()].into());

    match issuer.issue_for(subject, ttl.unwrap_or(config.session.ttl)) {
        Ok(session) => {
            println!(
                "Session for '{}' (tenant: '{}', role: {}, expires in {}s):",
                session.user_id,
                session.tenant_id,
                role.map_or_else(|| "none".to_string(), |r| r.name),
                session.expires_in()
            );
            println!("{}", session.token);
            println!("\nAuthorization: Bearer {}", session.token);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ {e}");
            ExitCode::FAILURE
        }
    }
}

/// Evaluate one authorization decision against the configured roles
async fn run_check(
    config: &Config,
    user_id: &str,
    action: Action,
    resource: ResourceKind,
    tenant_id: Option<&str>,
) -> ExitCode {
    let store = match InMemoryRoleStore::from_config(&config.rbac) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    };
    let record = store.get_user(user_id).await.ok().flatten();
    let Some(user_tenant) = record.map(|r| r.tenant_id) else {
        eprintln!("❌ User '{user_id}' is not configured");
        return ExitCode::FAILURE;
    };
    let resource_tenant = tenant_id.unwrap_or(&user_tenant).to_string();

    let cache = RoleCache::new(
        store as Arc<dyn RoleStore>,
        Arc::new(SystemClock),
        config.rbac.role_cache_ttl,
        config.rbac.lookup_timeout,
    );
    let policy = PolicyEngine::new(Arc::new(cache));
    let resource = ResourceRef::in_tenant(resource, resource_tenant);

    let decision = match policy.principal(user_id, &user_tenant).await {
        Ok(principal) => policy.authorize(&principal, action, &resource).await,
        Err(e) => Err(e),
    };
    match decision {
        Ok(Decision::Allowed) => {
            println!("✅ {user_id} may {action} {} in {}", resource.kind, user_tenant);
            ExitCode::SUCCESS
        }
        Ok(Decision::Denied(reason)) => {
            println!("🚫 {user_id} may not {action} {}: {reason}", resource.kind);
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("❌ {e}");
            ExitCode::FAILURE
        }
    }
}

/// Print the role catalogue and user assignments
async fn run_roles(config: &Config, tenant_id: Option<&str>) -> ExitCode {
    let store = match InMemoryRoleStore::from_config(&config.rbac) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    };

    println!("Available roles:");
    for role in &config.rbac.roles {
        println!("  {:<12} rank {}  (id: {})", role.name, role.rank, role.id);
    }

    let mut tenants: Vec<&str> = config
        .rbac
        .users
        .iter()
        .map(|u| u.tenant_id.as_str())
        .filter(|t| tenant_id.is_none_or(|wanted| wanted == *t))
        .collect();
    tenants.sort_unstable();
    tenants.dedup();

    for tenant in tenants {
        println!("\nTenant {tenant}:");
        let users = match store.tenant_users(tenant).await {
            Ok(users) => users,
            Err(e) => {
                eprintln!("❌ {e}");
                return ExitCode::FAILURE;
            }
        };
        for user in users {
            let role = match store.get_role(&user.user_id).await {
                Ok(Some(role)) => role.name,
                Ok(None) => "No role".to_string(),
                Err(e) => {
                    eprintln!("❌ {e}");
                    return ExitCode::FAILURE;
                }
            };
            println!("  {:<40} {role}", user.user_id);
        }
    }
    ExitCode::SUCCESS
}

/// Run the HTTP server
async fn run_server(mut config: Config, port: Option<u16>, host: Option<String>) -> ExitCode {
    // Apply CLI overrides
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(host) = host {
        config.server.host = host;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        tenant = %config.identity.tenant_id,
        "Starting RBAC Gateway"
    );

    let server = match Server::from_config(config) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Run with graceful shutdown
    if let Err(e) = server.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}
