//! Gateway server.
//!
//! Owns process lifecycle: builds the shared state, spawns the plaintext
//! health listener, wraps the main listener in TLS, and serves until the
//! process is stopped.  All configuration problems (bad URLs, unreadable
//! certificate files) surface here as startup errors.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::response::Html;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::router::{AppState, create_router};
use crate::config::Config;
use crate::tls::{TlsConnectInfo, TlsListener, build_tls_config};
use crate::Result;

/// Body served by the health listener, for any method and path.
const HEALTH_BODY: &str = "<html><body><h1>It works!</h1></body></html>";

/// The mTLS gateway server.
pub struct Gateway {
    config: Config,
    state: Arc<AppState>,
}

impl Gateway {
    /// Create a new gateway.
    ///
    /// # Errors
    ///
    /// Fails when any configured URL is unparsable; certificate files are
    /// read later, in [`run`](Self::run).
    pub fn new(config: Config) -> Result<Self> {
        let state = Arc::new(AppState::from_config(&config)?);
        Ok(Self { config, state })
    }

    /// Run the gateway until the process is stopped.
    ///
    /// # Errors
    ///
    /// Fails when certificate material cannot be loaded or a listener
    /// cannot bind.
    pub async fn run(self) -> Result<()> {
        let tls_config = Arc::new(build_tls_config(&self.config.tls)?);

        // Plaintext health listener, answers 200 on any method and path
        let health_addr = SocketAddr::from(([0, 0, 0, 0], self.config.server.health_port));
        let health_listener = TcpListener::bind(health_addr).await?;
        tokio::spawn(async move {
            if let Err(e) = axum::serve(health_listener, health_router()).await {
                error!(error = %e, "Health listener terminated");
            }
        });

        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.server.port));
        let listener = TcpListener::bind(addr).await?;
        let tls_listener = TlsListener::new(listener, tls_config);

        info!("============================================================");
        info!("MTLS GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(port = self.config.server.port, health_port = self.config.server.health_port, "Listening");
        info!(
            auth_host = %self.state.auth_host,
            upstream = %self.state.auth_target.base(),
            "Auth pipeline (pass-through)"
        );
        info!(
            api_host = %self.state.api_host,
            upstream = %self.state.api_target.base(),
            "Api pipeline (token-enforced)"
        );
        info!("============================================================");

        let app = create_router(self.state);
        axum::serve(
            tls_listener,
            app.into_make_service_with_connect_info::<TlsConnectInfo>(),
        )
        .await?;

        Ok(())
    }
}

/// Router for the plaintext health listener.
fn health_router() -> Router {
    Router::new().fallback(|| async { Html(HEALTH_BODY) })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
