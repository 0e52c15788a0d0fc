//! The device-linking connector seam.
//!
//! A [`Connector`] builds one live link per identity. The link is split in
//! two: a [`ConnectorHandle`] for commands and an event receiver that the
//! session driver consumes exclusively.
//!
//! Implementations:
//! - [`sidecar::SidecarConnector`]: external process speaking JSON lines
//! - [`crate::testing::FakeConnector`]: scriptable in-memory connector for tests

pub mod sidecar;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use pairlink_core::Identity;
use tokio::sync::mpsc;

/// Buffer size of a link's event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Events emitted by a live connector link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectorEvent {
    /// A QR code was rendered (unused by code pairing, kept for liveness).
    QrReceived,
    /// The connector produced a pairing code on its own.
    PairingCodeReady(String),
    /// The remote device confirmed and the link is open.
    ConnectionOpen,
    /// The link closed.
    ConnectionClose {
        /// Connector-supplied reason.
        reason: String,
    },
    /// The connector persisted new credentials.
    CredentialsUpdated,
}

/// Errors reported by a connector.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConnectorError {
    /// The connector could not be started.
    #[error("connector failed to start: {0}")]
    Spawn(String),
    /// The connector rejected or failed a request.
    #[error("connector request failed: {0}")]
    Request(String),
    /// The connector spoke something other than the expected protocol.
    #[error("connector protocol error: {0}")]
    Protocol(String),
    /// The link is gone.
    #[error("connector link closed")]
    Closed,
}

/// Command side of a live link.
#[async_trait]
pub trait ConnectorHandle: Send + Sync {
    /// Ask the connector for a pairing code for `identity`.
    async fn request_pairing_code(&self, identity: &Identity) -> Result<String, ConnectorError>;

    /// Send `payload` to the device linked as `identity`.
    async fn send_payload(&self, identity: &Identity, payload: &[u8])
    -> Result<(), ConnectorError>;

    /// Opaque snapshot of the link's authenticated credentials.
    async fn snapshot_credentials(&self) -> Result<Vec<u8>, ConnectorError>;

    /// Tear the link down. Called at most once per handle.
    async fn close(&self);
}

/// A freshly created link.
pub struct ConnectorLink {
    /// Command handle.
    pub handle: Arc<dyn ConnectorHandle>,
    /// Event stream; ends when the link goes away.
    pub events: mpsc::Receiver<ConnectorEvent>,
}

impl std::fmt::Debug for ConnectorLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorLink").finish_non_exhaustive()
    }
}

/// Factory for live links.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Create a link for `identity`, persisting credentials under `credential_dir`.
    async fn create_connection(
        &self,
        identity: &Identity,
        credential_dir: &Path,
    ) -> Result<ConnectorLink, ConnectorError>;
}
