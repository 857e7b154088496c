//! Gateway server

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use super::router::{AppState, SIGN_PATH, create_router};
use crate::config::Config;
use crate::config_reload::{ConsumerWatcher, LiveConsumers};
use crate::jwt_auth::{JwtAuthenticator, KeyResolver, audit};
use crate::revocation::{RedisConnector, RevocationStoreClient};
use crate::vault::{HttpVault, SecretVault};
use crate::{Error, Result};

/// JWT authentication gateway
pub struct Gateway {
    config: Config,
    config_path: Option<PathBuf>,
    authenticator: Arc<JwtAuthenticator>,
}

impl Gateway {
    /// Wire up vault, revocation store and authenticator from `config`.
    ///
    /// `config_path` is watched for consumer changes when
    /// `server.watch_config` is set.
    pub fn new(config: Config, config_path: Option<PathBuf>) -> Result<Self> {
        let vault = config
            .vault
            .as_ref()
            .map(|v| HttpVault::new(v).map(|h| Arc::new(h) as Arc<dyn SecretVault>))
            .transpose()?;

        let mut settings = config.jwt_auth.clone();
        if config.server.sign_endpoint && !settings.skip_paths.iter().any(|p| p == SIGN_PATH) {
            settings.skip_paths.push(SIGN_PATH.to_string());
        }

        let authenticator = Arc::new(JwtAuthenticator::new(
            settings,
            Arc::new(LiveConsumers::new(config.consumers.clone())),
            KeyResolver::new(vault),
            Arc::new(RevocationStoreClient::new(RedisConnector)),
        ));

        Ok(Self {
            config,
            config_path,
            authenticator,
        })
    }

    /// The authenticator serving requests.
    #[must_use]
    pub fn authenticator(&self) -> &Arc<JwtAuthenticator> {
        &self.authenticator
    }

    /// Serve until Ctrl+C / SIGTERM.
    pub async fn run(self) -> Result<()> {
        let server = &self.config.server;
        let addr: SocketAddr = format!("{}:{}", server.host, server.port)
            .parse()
            .map_err(|e| Error::Config(format!("Invalid server address: {e}")))?;

        audit::describe_metrics();

        let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

        // Keep the watcher alive for the lifetime of the server.
        let _watcher = match (&self.config_path, server.watch_config) {
            (Some(path), true) => {
                match ConsumerWatcher::start(
                    path.clone(),
                    Arc::clone(self.authenticator.consumers()),
                    shutdown_tx.subscribe(),
                ) {
                    Ok(w) => {
                        info!(path = %path.display(), "Watching config for consumer changes");
                        Some(w)
                    }
                    Err(e) => {
                        warn!(error = %e, "Config watching disabled");
                        None
                    }
                }
            }
            _ => None,
        };

        let state = Arc::new(AppState {
            authenticator: Arc::clone(&self.authenticator),
            sign_endpoint: server.sign_endpoint,
            request_timeout: server.request_timeout,
        });
        let app = create_router(state);

        let listener = TcpListener::bind(addr).await?;
        info!(
            version = env!("CARGO_PKG_VERSION"),
            host = %server.host,
            port = server.port,
            consumers = self.config.consumers.len(),
            sign_endpoint = server.sign_endpoint,
            "jwt-gate listening"
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Shutdown complete");
        Ok(())
    }
}

async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
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
    let _ = shutdown_tx.send(());
}
