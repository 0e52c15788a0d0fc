//! Scriptable in-memory connector.
//!
//! [`FakeConnector`] stands in for the external process in unit and
//! integration tests, including the HTTP layer's. It records every call and
//! can be told to fail, hang, or push events.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use pairlink_core::Identity;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::connector::{
    Connector, ConnectorError, ConnectorEvent, ConnectorHandle, ConnectorLink,
    EVENT_CHANNEL_CAPACITY,
};

/// Behaviour of a [`FakeConnector`].
#[derive(Clone, Debug)]
pub struct FakeScript {
    /// Creation calls that fail before one succeeds.
    pub failures_before_success: u32,
    /// Creation never returns.
    pub hang_create: bool,
    /// Code returned by `request_pairing_code`; `None` makes it fail.
    pub request_code: Option<String>,
    /// Code pushed as an event right after creation.
    pub pushed_code: Option<String>,
    /// `request_pairing_code` never returns.
    pub hang_request: bool,
    /// Identities whose `close` never returns.
    pub hang_close: HashSet<Identity>,
    /// `send_payload` fails.
    pub fail_delivery: bool,
    /// Bytes returned by `snapshot_credentials`.
    pub snapshot: Vec<u8>,
}

impl Default for FakeScript {
    fn default() -> Self {
        Self {
            failures_before_success: 0,
            hang_create: false,
            request_code: Some("PAIR0001".to_string()),
            pushed_code: None,
            hang_request: false,
            hang_close: HashSet::new(),
            fail_delivery: false,
            snapshot: br#"{"token":"fake"}"#.to_vec(),
        }
    }
}

#[derive(Default)]
struct FakeState {
    creates: Mutex<Vec<(Identity, Instant)>>,
    dirs: Mutex<Vec<PathBuf>>,
    closes: Mutex<Vec<Identity>>,
    payloads: Mutex<Vec<(Identity, Vec<u8>)>>,
    senders: Mutex<HashMap<Identity, mpsc::Sender<ConnectorEvent>>>,
}

/// In-memory [`Connector`].
#[derive(Clone, Default)]
pub struct FakeConnector {
    script: Arc<Mutex<FakeScript>>,
    state: Arc<FakeState>,
}

impl FakeConnector {
    /// Connector that succeeds immediately and answers requests with `PAIR0001`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole script.
    #[must_use]
    pub fn with_script(self, script: FakeScript) -> Self {
        *self.script.lock() = script;
        self
    }

    /// Answer `request_pairing_code` with `code`.
    #[must_use]
    pub fn with_request_code(self, code: &str) -> Self {
        self.script.lock().request_code = Some(code.to_string());
        self
    }

    /// Push `code` as a `PairingCodeReady` event on creation.
    #[must_use]
    pub fn with_pushed_code(self, code: &str) -> Self {
        self.script.lock().pushed_code = Some(code.to_string());
        self
    }

    /// Fail the first `n` creation calls.
    #[must_use]
    pub fn failing_first(self, n: u32) -> Self {
        self.script.lock().failures_before_success = n;
        self
    }

    /// Never return from creation.
    #[must_use]
    pub fn hanging_create(self) -> Self {
        self.script.lock().hang_create = true;
        self
    }

    /// Never return from `request_pairing_code`.
    #[must_use]
    pub fn hanging_request(self) -> Self {
        self.script.lock().hang_request = true;
        self
    }

    /// Fail `request_pairing_code`.
    #[must_use]
    pub fn without_code(self) -> Self {
        self.script.lock().request_code = None;
        self
    }

    /// Never return from `close` for `identity`.
    #[must_use]
    pub fn hanging_close_for(self, identity: &Identity) -> Self {
        let _ = self.script.lock().hang_close.insert(identity.clone());
        self
    }

    /// Fail every `send_payload`.
    #[must_use]
    pub fn failing_delivery(self) -> Self {
        self.script.lock().fail_delivery = true;
        self
    }

    /// Push `event` to the live link for `identity`.
    ///
    /// Returns `false` when no link is open for that identity.
    pub async fn emit(&self, identity: &Identity, event: ConnectorEvent) -> bool {
        let sender = self.state.senders.lock().get(identity).cloned();
        match sender {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Drop the event sender for `identity`, ending its stream.
    pub fn end_events(&self, identity: &Identity) -> bool {
        self.state.senders.lock().remove(identity).is_some()
    }

    /// Times at which creation was attempted.
    pub fn create_times(&self) -> Vec<Instant> {
        self.state.creates.lock().iter().map(|(_, t)| *t).collect()
    }

    /// Number of creation attempts for `identity`.
    pub fn creates_for(&self, identity: &Identity) -> usize {
        self.state
            .creates
            .lock()
            .iter()
            .filter(|(who, _)| who == identity)
            .count()
    }

    /// Credential directories passed to creation.
    pub fn credential_dirs(&self) -> Vec<PathBuf> {
        self.state.dirs.lock().clone()
    }

    /// Total completed `close` calls.
    pub fn close_count(&self) -> usize {
        self.state.closes.lock().len()
    }

    /// Completed `close` calls for `identity`.
    pub fn closes_for(&self, identity: &Identity) -> usize {
        self.state
            .closes
            .lock()
            .iter()
            .filter(|who| *who == identity)
            .count()
    }

    /// Payloads delivered so far.
    pub fn payloads(&self) -> Vec<(Identity, Vec<u8>)> {
        self.state.payloads.lock().clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn create_connection(
        &self,
        identity: &Identity,
        credential_dir: &Path,
    ) -> Result<ConnectorLink, ConnectorError> {
        self.state
            .creates
            .lock()
            .push((identity.clone(), Instant::now()));
        self.state.dirs.lock().push(credential_dir.to_path_buf());

        let script = self.script.lock().clone();
        if script.hang_create {
            futures::future::pending::<()>().await;
        }
        if script.failures_before_success > 0 {
            self.script.lock().failures_before_success -= 1;
            return Err(ConnectorError::Spawn("scripted failure".into()));
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        if let Some(code) = &script.pushed_code {
            let _ = tx.try_send(ConnectorEvent::PairingCodeReady(code.clone()));
        }
        let _ = self.state.senders.lock().insert(identity.clone(), tx);

        let handle = FakeHandle {
            identity: identity.clone(),
            script: Arc::clone(&self.script),
            state: Arc::clone(&self.state),
        };
        Ok(ConnectorLink {
            handle: Arc::new(handle),
            events: rx,
        })
    }
}

/// Handle produced by [`FakeConnector`].
pub struct FakeHandle {
    identity: Identity,
    script: Arc<Mutex<FakeScript>>,
    state: Arc<FakeState>,
}

impl FakeHandle {
    /// Number of completed `close` calls on this handle's connector.
    pub fn close_count(&self) -> usize {
        self.state.closes.lock().len()
    }
}

impl Default for FakeHandle {
    fn default() -> Self {
        Self {
            identity: Identity::parse("0000000").expect("static identity is valid"),
            script: Arc::default(),
            state: Arc::default(),
        }
    }
}

#[async_trait]
impl ConnectorHandle for FakeHandle {
    async fn request_pairing_code(&self, _identity: &Identity) -> Result<String, ConnectorError> {
        let script = self.script.lock().clone();
        if script.hang_request {
            futures::future::pending::<()>().await;
        }
        script
            .request_code
            .ok_or_else(|| ConnectorError::Request("pairing code unavailable".into()))
    }

    async fn send_payload(&self, identity: &Identity, payload: &[u8]) -> Result<(), ConnectorError> {
        if self.script.lock().fail_delivery {
            return Err(ConnectorError::Request("recipient unreachable".into()));
        }
        self.state
            .payloads
            .lock()
            .push((identity.clone(), payload.to_vec()));
        Ok(())
    }

    async fn snapshot_credentials(&self) -> Result<Vec<u8>, ConnectorError> {
        Ok(self.script.lock().snapshot.clone())
    }

    async fn close(&self) {
        let hang = self.script.lock().hang_close.contains(&self.identity);
        if hang {
            futures::future::pending::<()>().await;
        }
        let _ = self.state.senders.lock().remove(&self.identity);
        self.state.closes.lock().push(self.identity.clone());
    }
}
