//! `PairlinkServer`: the axum listener.

use std::net::SocketAddr;
use std::time::Instant;

use axum::Router;
use axum::routing::{delete, get, post};
use pairlink_runtime::PairingService;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::routes;

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Session lifecycle.
    pub service: PairingService,
    /// When the server started.
    pub start_time: Instant,
}

/// HTTP front of the broker.
pub struct PairlinkServer {
    config: ServerConfig,
    service: PairingService,
    shutdown: CancellationToken,
    start_time: Instant,
}

impl PairlinkServer {
    /// Create a server that stops accepting when `shutdown` fires.
    pub fn new(config: ServerConfig, service: PairingService, shutdown: CancellationToken) -> Self {
        Self {
            config,
            service,
            shutdown,
            start_time: Instant::now(),
        }
    }

    /// Build the router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            service: self.service.clone(),
            start_time: self.start_time,
        };

        Router::new()
            .route("/api/request-pair-code", post(routes::request_pair_code))
            .route("/api/session-status/{phone}", get(routes::session_status))
            .route("/api/cleanup-session/{phone}", delete(routes::cleanup_session))
            .route("/api/health", get(routes::health))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Bind and serve in the background.
    ///
    /// Returns the bound address and the serving task, which finishes once
    /// the shutdown token fires and in-flight requests complete.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        let app = self.router();
        let token = self.shutdown.clone();

        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            match served {
                Ok(()) => info!("http listener stopped"),
                Err(e) => error!(error = %e, "http listener failed"),
            }
        });
        Ok((addr, handle))
    }

    /// The session service behind this server.
    pub fn service(&self) -> &PairingService {
        &self.service
    }

    /// The listener configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}
