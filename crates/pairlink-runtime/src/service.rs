//! The session lifecycle manager's public face.
//!
//! [`PairingService`] is a cheap-to-clone handle over the shared
//! [`SessionContext`]. The HTTP layer talks only to this type.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pairlink_core::{Identity, LinkError, RetryConfig, SessionStatus};
use pairlink_settings::{PairlinkSettings, pairlink_home};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::connector::Connector;
use crate::context::{CleanupReason, LifecycleConfig, SessionContext};
use crate::credentials::CredentialStore;
use crate::factory::ClientFactory;
use crate::lifecycle::{SessionStarted, start_session};
use crate::reaper::ExpiryReaper;
use crate::registry::{SessionRecord, SessionRegistry};
use crate::shutdown::{DrainReport, ShutdownCoordinator};

/// Construction parameters for [`PairingService`].
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    /// Root of the per-identity credential directories.
    pub storage_root: PathBuf,
    /// Connector-creation retries.
    pub retry: RetryConfig,
    /// Driver timing.
    pub lifecycle: LifecycleConfig,
    /// Maximum concurrent sessions.
    pub max_sessions: usize,
}

impl ServiceConfig {
    /// Build from loaded settings, resolving the storage root under `home`.
    pub fn from_settings(settings: &PairlinkSettings) -> Self {
        Self {
            storage_root: settings.storage.resolve_root(&pairlink_home()),
            retry: settings.retry,
            lifecycle: LifecycleConfig::from_settings(settings),
            max_sessions: settings.session.max_concurrent_sessions,
        }
    }
}

/// What `GetStatus` reports about an identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    /// Whether a live session exists.
    pub active: bool,
    /// Its status, when active.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    /// Its last update, when active.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    /// Its pairing code, once issued.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pairing_code: Option<String>,
}

impl StatusView {
    fn inactive() -> Self {
        Self {
            active: false,
            status: None,
            last_updated: None,
            pairing_code: None,
        }
    }
}

impl From<SessionRecord> for StatusView {
    fn from(record: SessionRecord) -> Self {
        Self {
            active: true,
            status: Some(record.status),
            last_updated: Some(record.last_updated),
            pairing_code: record.pairing_code,
        }
    }
}

/// Handle to the session lifecycle manager.
#[derive(Clone)]
pub struct PairingService {
    ctx: Arc<SessionContext>,
}

impl PairingService {
    /// Build a service around `connector`.
    ///
    /// `shutdown` is the process-wide token; once it fires no new sessions
    /// start.
    pub fn new(
        connector: Arc<dyn Connector>,
        config: ServiceConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let store = CredentialStore::new(config.storage_root);
        let factory = ClientFactory::new(connector, store.clone(), config.retry);
        Self {
            ctx: Arc::new(SessionContext {
                registry: SessionRegistry::new(config.max_sessions),
                factory,
                store,
                config: config.lifecycle,
                shutdown,
            }),
        }
    }

    /// Start a session for `raw_identity` and return its pairing code.
    #[instrument(skip_all, fields(identity = raw_identity))]
    pub async fn create_session(&self, raw_identity: &str) -> Result<SessionStarted, LinkError> {
        let identity = self.parse(raw_identity)?;
        start_session(Arc::clone(&self.ctx), identity).await
    }

    /// Current status of `raw_identity`. Never blocks on connector I/O.
    pub fn get_status(&self, raw_identity: &str) -> Result<StatusView, LinkError> {
        let identity = self.parse(raw_identity)?;
        Ok(self
            .ctx
            .registry
            .get(&identity)
            .map_or_else(StatusView::inactive, StatusView::from))
    }

    /// Tear down `raw_identity`'s session if one exists.
    ///
    /// Returns whether this call removed a session; redundant calls succeed
    /// with `false`.
    pub async fn cleanup_session(&self, raw_identity: &str) -> Result<bool, LinkError> {
        let identity = self.parse(raw_identity)?;
        let ctx = Arc::clone(&self.ctx);
        let target = identity.clone();
        // teardown runs detached so a dropped caller cannot leave the entry releasing
        let removed = tokio::spawn(async move {
            ctx.cleanup(&target, None, CleanupReason::Requested).await
        })
        .await
        .map_err(|e| LinkError::Cleanup(format!("cleanup aborted: {e}")))?;
        info!(identity = %identity, removed, "cleanup requested");
        Ok(removed)
    }

    /// Number of live sessions.
    pub fn active_count(&self) -> usize {
        self.ctx.registry.active_count()
    }

    /// Copies of every live session.
    pub fn sessions(&self) -> Vec<SessionRecord> {
        self.ctx.registry.snapshot()
    }

    /// Shared context, for the reaper and shutdown.
    pub fn context(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    /// Expiry sweep over this service's sessions.
    pub fn reaper(&self, interval: Duration, max_age: Duration) -> ExpiryReaper {
        ExpiryReaper::new(Arc::clone(&self.ctx), interval, max_age)
    }

    /// Signal shutdown and drain every session.
    pub async fn shutdown(&self, per_session: Duration) -> DrainReport {
        ShutdownCoordinator::with_token(self.ctx.shutdown.clone())
            .drain(&self.ctx, Some(per_session))
            .await
    }

    fn parse(&self, raw: &str) -> Result<Identity, LinkError> {
        Identity::parse_with(raw, self.ctx.config.identity_rules)
    }
}
