//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use super::router::create_router;
use super::service::Gateway;
use crate::config::Config;
use crate::{Error, Result};

/// HTTP server around a [`Gateway`]
pub struct Server {
    config: Config,
    gateway: Arc<Gateway>,
}

impl Server {
    /// Create a server
    pub fn new(config: Config, gateway: Gateway) -> Self {
        Self {
            config,
            gateway: Arc::new(gateway),
        }
    }

    /// Create a server and its gateway from configuration
    pub fn from_config(config: Config) -> Result<Self> {
        let gateway = Gateway::from_config(&config)?;
        Ok(Self::new(config, gateway))
    }

    /// Run until Ctrl+C or SIGTERM
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let app = create_router(
            Arc::clone(&self.gateway),
            self.config.server.request_timeout,
        );
        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("RBAC GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        info!(audience = %self.config.identity.audience(), "Accepting external tokens");
        info!(
            ttl_secs = self.config.session.ttl.as_secs(),
            policy = ?self.config.session.ttl_policy,
            "Internal sessions"
        );
        if self.config.session.signing_keys.is_empty() {
            warn!("Sessions are signed with an ephemeral key and will not survive a restart");
        }
        info!("============================================================");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("Gateway stopped");
        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
