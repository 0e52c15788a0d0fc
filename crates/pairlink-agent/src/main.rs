//! # pairlink-agent
//!
//! Broker binary: loads settings, wires the session lifecycle to the
//! process-backed connector, serves HTTP, and drains sessions on shutdown.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use pairlink_core::logging::init_subscriber;
use pairlink_runtime::connector::sidecar::SidecarConnector;
use pairlink_runtime::{PairingService, ServiceConfig};
use pairlink_server::{PairlinkServer, ServerConfig};
use pairlink_settings::{PairlinkSettings, load_settings, load_settings_from_path};
use tokio_util::sync::CancellationToken;

/// Device-linking session broker.
#[derive(Parser, Debug)]
#[command(name = "pairlink-agent", about = "Device-linking session broker")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (default `~/.pairlink/settings.json`).
    #[arg(long, env = "PAIRLINK_SETTINGS")]
    settings: Option<PathBuf>,

    /// Credential storage root (overrides settings).
    #[arg(long)]
    storage_root: Option<String>,

    /// Log level or `EnvFilter` directive (overrides settings).
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn load(&self) -> Result<PairlinkSettings> {
        let mut settings = match &self.settings {
            Some(path) => load_settings_from_path(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?,
            None => load_settings().context("Failed to load settings")?,
        };
        self.apply(&mut settings);
        Ok(settings)
    }

    /// Command-line flags win over every settings layer.
    fn apply(&self, settings: &mut PairlinkSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(root) = &self.storage_root {
            settings.storage.root.clone_from(root);
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.load()?;
    init_subscriber(&settings.logging.level, settings.logging.format);

    let shutdown = CancellationToken::new();
    let service_config = ServiceConfig::from_settings(&settings);
    let storage_root = service_config.storage_root.clone();
    let connector = Arc::new(SidecarConnector::new(settings.connector.clone()));
    let service = PairingService::new(connector, service_config, shutdown.clone());

    let reaper = service
        .reaper(settings.reaper.interval(), settings.reaper.max_age())
        .spawn(shutdown.clone());

    let server_config = ServerConfig::from_settings(&settings);
    let bind = server_config.bind_addr();
    let server = PairlinkServer::new(server_config, service.clone(), shutdown.clone());
    let (addr, http) = server
        .listen()
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;

    tracing::info!(
        %addr,
        storage_root = %storage_root.display(),
        connector = %settings.connector.command,
        max_sessions = settings.session.max_concurrent_sessions,
        "pairlink agent listening"
    );

    wait_for_signal().await?;

    tracing::info!("Shutting down...");
    let report = service
        .shutdown(settings.shutdown.per_session_timeout())
        .await;
    if let Err(e) = http.await {
        tracing::warn!(error = %e, "http task ended abnormally");
    }
    if let Err(e) = reaper.await {
        tracing::warn!(error = %e, "expiry sweep ended abnormally");
    }

    tracing::info!(
        drained = report.completed,
        timed_out = report.timed_out,
        "Shutdown complete"
    );
    Ok(())
}

/// Resolve on Ctrl-C or SIGTERM.
#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("Failed to listen for ctrl-c"),
        _ = term.recv() => Ok(()),
    }
}

/// Resolve on Ctrl-C.
#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")
}
