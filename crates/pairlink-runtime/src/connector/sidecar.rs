//! Process-backed connector speaking newline-delimited JSON over stdio.
//!
//! One child process per session. Messages in each direction are single
//! JSON objects terminated by `\n`:
//!
//! ```text
//! -> {"id": 1, "method": "requestPairingCode", "params": {"identity": "15551234567"}}
//! <- {"id": 1, "result": {"code": "ABCD1234"}}
//! <- {"id": 2, "error": {"message": "not ready"}}
//! <- {"event": "open", "params": {}}
//! ```
//!
//! Responses carry the `id` of their request and are routed to the waiting
//! caller through a oneshot channel. Anything with an `event` field instead
//! is translated into a [`ConnectorEvent`]. Creation completes when the
//! child emits `ready`.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::StreamExt;
use pairlink_core::Identity;
use pairlink_settings::ConnectorSettings;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, warn};

use super::{
    Connector, ConnectorError, ConnectorEvent, ConnectorHandle, ConnectorLink,
    EVENT_CHANNEL_CAPACITY,
};

/// Longest line accepted from the child.
const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;
/// How long `close` waits for the child to acknowledge before killing it.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize)]
struct Request<'a> {
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RemoteError {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Incoming {
    Response {
        id: u64,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<RemoteError>,
    },
    Event {
        event: String,
        #[serde(default)]
        params: Value,
    },
}

/// In-flight requests; `None` once the reader has stopped.
type Pending = Arc<Mutex<Option<HashMap<u64, oneshot::Sender<Result<Value, ConnectorError>>>>>>;

/// Launches the configured program once per identity.
pub struct SidecarConnector {
    settings: ConnectorSettings,
}

impl SidecarConnector {
    /// Connector launching `settings.command`.
    pub fn new(settings: ConnectorSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Connector for SidecarConnector {
    async fn create_connection(
        &self,
        identity: &Identity,
        credential_dir: &Path,
    ) -> Result<ConnectorLink, ConnectorError> {
        let mut child = Command::new(&self.settings.command)
            .args(&self.settings.args)
            .envs(&self.settings.env)
            .env("PAIRLINK_IDENTITY", identity.as_str())
            .env("PAIRLINK_CREDENTIAL_DIR", credential_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ConnectorError::Spawn(format!("{}: {e}", self.settings.command)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ConnectorError::Spawn("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ConnectorError::Spawn("child stdout unavailable".into()))?;
        debug!(identity = %identity, pid = child.id(), "connector process started");

        let (handle, events, ready) = spawn_link(stdout, stdin);
        *handle.child.lock() = Some(child);

        // dropping the handle on failure kills the child
        ready
            .await
            .map_err(|_| ConnectorError::Spawn("connector exited before it was ready".into()))?;
        Ok(ConnectorLink { handle, events })
    }
}

/// Command side of a sidecar link.
pub struct SidecarHandle {
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: Pending,
    next_id: AtomicU64,
    child: Mutex<Option<Child>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SidecarHandle {
    async fn call(&self, method: &str, params: Value) -> Result<Value, ConnectorError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut line = serde_json::to_string(&Request { id, method, params })
            .map_err(|e| ConnectorError::Protocol(e.to_string()))?;
        line.push('\n');

        let (tx, rx) = oneshot::channel();
        match self.pending.lock().as_mut() {
            Some(pending) => {
                let _ = pending.insert(id, tx);
            }
            None => return Err(ConnectorError::Closed),
        }

        let written = {
            let mut writer = self.writer.lock().await;
            match writer.write_all(line.as_bytes()).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = written {
            if let Some(pending) = self.pending.lock().as_mut() {
                let _ = pending.remove(&id);
            }
            debug!(method, error = %e, "connector write failed");
            return Err(ConnectorError::Closed);
        }

        rx.await.map_err(|_| ConnectorError::Closed)?
    }
}

#[async_trait]
impl ConnectorHandle for SidecarHandle {
    async fn request_pairing_code(&self, identity: &Identity) -> Result<String, ConnectorError> {
        let result = self
            .call("requestPairingCode", json!({ "identity": identity.as_str() }))
            .await?;
        result
            .get("code")
            .and_then(Value::as_str)
            .or_else(|| result.as_str())
            .map(str::to_owned)
            .ok_or_else(|| ConnectorError::Protocol(format!("no code in response: {result}")))
    }

    async fn send_payload(&self, identity: &Identity, payload: &[u8]) -> Result<(), ConnectorError> {
        let _ = self
            .call(
                "sendPayload",
                json!({ "identity": identity.as_str(), "payload": BASE64.encode(payload) }),
            )
            .await?;
        Ok(())
    }

    async fn snapshot_credentials(&self) -> Result<Vec<u8>, ConnectorError> {
        let result = self.call("snapshotCredentials", json!({})).await?;
        serde_json::to_vec(&result).map_err(|e| ConnectorError::Protocol(e.to_string()))
    }

    async fn close(&self) {
        if tokio::time::timeout(CLOSE_GRACE, self.call("close", json!({})))
            .await
            .is_err()
        {
            debug!("connector did not acknowledge close");
        }
        let child = self.child.lock().take();
        if let Some(mut child) = child {
            if let Err(e) = child.kill().await {
                debug!(error = %e, "connector process already gone");
            }
        }
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

/// Wire a handle and event stream onto an already-open transport.
///
/// The returned oneshot resolves when the peer emits `ready`, and errors if
/// the transport ends first.
pub fn spawn_link<R, W>(
    reader: R,
    writer: W,
) -> (
    Arc<SidecarHandle>,
    mpsc::Receiver<ConnectorEvent>,
    oneshot::Receiver<()>,
)
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let pending: Pending = Arc::new(Mutex::new(Some(HashMap::new())));
    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (ready_tx, ready_rx) = oneshot::channel();

    let task = tokio::spawn(read_loop(reader, Arc::clone(&pending), events_tx, ready_tx));
    let handle = Arc::new(SidecarHandle {
        writer: tokio::sync::Mutex::new(Box::new(writer)),
        pending,
        next_id: AtomicU64::new(1),
        child: Mutex::new(None),
        reader: Mutex::new(Some(task)),
    });
    (handle, events_rx, ready_rx)
}

async fn read_loop<R>(
    reader: R,
    pending: Pending,
    events: mpsc::Sender<ConnectorEvent>,
    ready: oneshot::Sender<()>,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    let mut ready = Some(ready);

    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "connector stream unreadable");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let message: Incoming = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "ignoring malformed connector message");
                continue;
            }
        };
        match message {
            Incoming::Response { id, result, error } => {
                let waiter = pending.lock().as_mut().and_then(|p| p.remove(&id));
                let Some(tx) = waiter else {
                    debug!(id, "response for unknown request");
                    continue;
                };
                let outcome = match error {
                    Some(err) => Err(ConnectorError::Request(err.message)),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                let _ = tx.send(outcome);
            }
            Incoming::Event { event, params } => {
                if event == "ready" {
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(());
                    }
                    continue;
                }
                match translate_event(&event, &params) {
                    Some(mapped) => {
                        if events.send(mapped).await.is_err() {
                            debug!("event receiver dropped");
                        }
                    }
                    None => debug!(event, "ignoring unknown connector event"),
                }
            }
        }
    }

    // fail every in-flight request and refuse new ones
    let _ = pending.lock().take();
}

fn translate_event(name: &str, params: &Value) -> Option<ConnectorEvent> {
    let text = |key: &str| params.get(key).and_then(Value::as_str).map(str::to_owned);
    match name {
        "qr" => Some(ConnectorEvent::QrReceived),
        "pairingCode" => text("code").map(ConnectorEvent::PairingCodeReady),
        "open" => Some(ConnectorEvent::ConnectionOpen),
        "close" => Some(ConnectorEvent::ConnectionClose {
            reason: text("reason").unwrap_or_else(|| "unspecified".to_string()),
        }),
        "credentials" => Some(ConnectorEvent::CredentialsUpdated),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, duplex};

    use super::*;

    struct Peer {
        requests: tokio::io::Lines<BufReader<DuplexStream>>,
        out: DuplexStream,
    }

    impl Peer {
        async fn next_request(&mut self) -> Value {
            let line = self.requests.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn send(&mut self, message: Value) {
            let mut line = message.to_string();
            line.push('\n');
            self.out.write_all(line.as_bytes()).await.unwrap();
        }
    }

    fn link() -> (
        Arc<SidecarHandle>,
        mpsc::Receiver<ConnectorEvent>,
        oneshot::Receiver<()>,
        Peer,
    ) {
        let (ours_write, theirs_read) = duplex(64 * 1024);
        let (theirs_write, ours_read) = duplex(64 * 1024);
        let (handle, events, ready) = spawn_link(ours_read, ours_write);
        let peer = Peer {
            requests: BufReader::new(theirs_read).lines(),
            out: theirs_write,
        };
        (handle, events, ready, peer)
    }

    fn who() -> Identity {
        Identity::parse("15551234567").unwrap()
    }

    #[tokio::test]
    async fn ready_event_resolves_ready() {
        let (_handle, _events, ready, mut peer) = link();
        peer.send(json!({"event": "ready"})).await;
        ready.await.unwrap();
    }

    #[tokio::test]
    async fn pairing_code_request_round_trip() {
        let (handle, _events, _ready, mut peer) = link();
        let call = tokio::spawn({
            let handle = Arc::clone(&handle);
            async move { handle.request_pairing_code(&who()).await }
        });

        let request = peer.next_request().await;
        assert_eq!(request["method"], "requestPairingCode");
        assert_eq!(request["params"]["identity"], "15551234567");
        peer.send(json!({"id": request["id"], "result": {"code": "ABC123"}}))
            .await;

        assert_eq!(call.await.unwrap().unwrap(), "ABC123");
    }

    #[tokio::test]
    async fn remote_error_becomes_request_error() {
        let (handle, _events, _ready, mut peer) = link();
        let call = tokio::spawn({
            let handle = Arc::clone(&handle);
            async move { handle.snapshot_credentials().await }
        });
        let request = peer.next_request().await;
        peer.send(json!({"id": request["id"], "error": {"message": "not linked"}}))
            .await;
        assert_eq!(
            call.await.unwrap().unwrap_err(),
            ConnectorError::Request("not linked".into())
        );
    }

    #[tokio::test]
    async fn payload_is_base64_on_the_wire() {
        let (handle, _events, _ready, mut peer) = link();
        let call = tokio::spawn({
            let handle = Arc::clone(&handle);
            async move { handle.send_payload(&who(), b"hi").await }
        });
        let request = peer.next_request().await;
        assert_eq!(request["method"], "sendPayload");
        assert_eq!(request["params"]["payload"], "aGk=");
        peer.send(json!({"id": request["id"], "result": null})).await;
        call.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn events_are_translated() {
        let (_handle, mut events, _ready, mut peer) = link();
        peer.send(json!({"event": "qr", "params": {"data": "..."}})).await;
        peer.send(json!({"event": "pairingCode", "params": {"code": "XY12"}}))
            .await;
        peer.send(json!({"event": "mystery"})).await;
        peer.send(json!({"event": "open"})).await;
        peer.send(json!({"event": "close", "params": {"reason": "logged out"}}))
            .await;

        assert_eq!(events.recv().await, Some(ConnectorEvent::QrReceived));
        assert_eq!(
            events.recv().await,
            Some(ConnectorEvent::PairingCodeReady("XY12".into()))
        );
        assert_eq!(events.recv().await, Some(ConnectorEvent::ConnectionOpen));
        assert_eq!(
            events.recv().await,
            Some(ConnectorEvent::ConnectionClose {
                reason: "logged out".into()
            })
        );
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let (_handle, mut events, _ready, mut peer) = link();
        peer.out.write_all(b"this is not json\n\n").await.unwrap();
        peer.send(json!({"event": "credentials"})).await;
        assert_eq!(events.recv().await, Some(ConnectorEvent::CredentialsUpdated));
    }

    #[tokio::test]
    async fn peer_exit_fails_pending_calls_and_ends_events() {
        let (handle, mut events, ready, mut peer) = link();
        let call = tokio::spawn({
            let handle = Arc::clone(&handle);
            async move { handle.request_pairing_code(&who()).await }
        });
        let _ = peer.next_request().await;
        drop(peer);

        assert_eq!(call.await.unwrap().unwrap_err(), ConnectorError::Closed);
        assert_eq!(events.recv().await, None);
        assert!(ready.await.is_err());
    }

    #[tokio::test]
    async fn unknown_response_ids_ignored() {
        let (_handle, mut events, _ready, mut peer) = link();
        peer.send(json!({"id": 999, "result": {}})).await;
        peer.send(json!({"event": "open"})).await;
        assert_eq!(events.recv().await, Some(ConnectorEvent::ConnectionOpen));
    }

    #[test]
    fn translate_close_without_reason() {
        assert_eq!(
            translate_event("close", &json!({})),
            Some(ConnectorEvent::ConnectionClose {
                reason: "unspecified".into()
            })
        );
        assert_eq!(translate_event("pairingCode", &json!({})), None);
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let connector = SidecarConnector::new(ConnectorSettings {
            command: "/nonexistent/pairlink-connector".into(),
            ..ConnectorSettings::default()
        });
        let err = connector
            .create_connection(&who(), Path::new("/tmp"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Spawn(_)));
    }
}
