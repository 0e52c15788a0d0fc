//! Session start-up and the per-session driver task.
//!
//! [`start_session`] claims the identity, then runs bring-up (create the
//! connector, obtain a pairing code) on its own task and waits for it.
//! Dropping the caller's future therefore never strands a half-built session.
//! Once the code is issued, bring-up spawns a session driver, which is the
//! only consumer of the link's events and owns the session's single active
//! timer:
//!
//! | status                      | timer            | on expiry              |
//! |-----------------------------|------------------|------------------------|
//! | `CodeGenerated`/`Connecting`| pairing deadline | `TimedOut`, cleanup    |
//! | `Connected`                 | settle delay     | deliver, `Completed`   |
//! | `Completed`                 | grace period     | cleanup                |
//!
//! The driver stops as soon as the session's cancellation token fires, which
//! happens whenever any path tears the session down.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use pairlink_core::{Identity, LinkError, SessionId, SessionStatus};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::connector::{ConnectorEvent, ConnectorHandle, ConnectorLink};
use crate::context::{CleanupReason, SessionContext};
use crate::registry::TransitionError;

/// What a successful [`start_session`] hands back to the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionStarted {
    /// Generation id of the new session.
    pub session_id: SessionId,
    /// Code the user enters on their device.
    pub pairing_code: String,
    /// Connector-creation attempts consumed.
    pub attempts: u32,
}

/// Claim `identity`, build its connector, and obtain a pairing code.
///
/// On any failure after the claim, the session is cleaned up before the
/// error is returned, so the identity is immediately claimable again.
pub async fn start_session(
    ctx: Arc<SessionContext>,
    identity: Identity,
) -> Result<SessionStarted, LinkError> {
    if ctx.shutdown.is_cancelled() {
        return Err(LinkError::Cancelled);
    }
    let claim = ctx.registry.register(&identity)?;
    let span = info_span!("session", identity = %identity, session_id = %claim.session_id);
    info!(parent: &span, "session claimed");

    let starter = Starter {
        ctx,
        identity,
        session_id: claim.session_id,
        cancel: claim.cancel,
    };
    tokio::spawn(starter.run(span.clone()).instrument(span))
        .await
        .unwrap_or_else(|e| Err(LinkError::Cleanup(format!("session start aborted: {e}"))))
}

struct Starter {
    ctx: Arc<SessionContext>,
    identity: Identity,
    session_id: SessionId,
    cancel: CancellationToken,
}

impl Starter {
    async fn run(self, span: tracing::Span) -> Result<SessionStarted, LinkError> {
        match self.bring_up().await {
            Ok((started, driver, pending)) => {
                drop(tokio::spawn(driver.run(pending).instrument(span)));
                info!(attempts = started.attempts, "pairing code issued");
                Ok(started)
            }
            Err(e) => {
                warn!(error = %e, category = e.category(), "session start failed");
                let _ = self
                    .ctx
                    .cleanup(&self.identity, Some(&self.session_id), CleanupReason::Failed)
                    .await;
                Err(e)
            }
        }
    }

    async fn bring_up(
        &self,
    ) -> Result<(SessionStarted, SessionDriver, Vec<ConnectorEvent>), LinkError> {
        let ctx = &self.ctx;
        self.advance(SessionStatus::Requesting)?;

        let created = ctx
            .factory
            .create_connection(&self.identity, &self.cancel)
            .await?;
        let _ = ctx
            .registry
            .set_retry_count(&self.identity, &self.session_id, created.attempts);

        let ConnectorLink { handle, mut events } = created.link;
        if let Err(orphan) =
            ctx.registry
                .attach_handle(&self.identity, &self.session_id, Arc::clone(&handle))
        {
            // torn down while the connector was being built; nobody else owns it
            let _ = tokio::time::timeout(ctx.config.close_timeout, orphan.close()).await;
            return Err(LinkError::Cancelled);
        }

        let (code, pending) = self.obtain_code(handle.as_ref(), &mut events).await?;
        let _ = ctx
            .registry
            .set_pairing_code(&self.identity, &self.session_id, &code);
        self.advance(SessionStatus::CodeGenerated)?;

        let driver = SessionDriver {
            ctx: Arc::clone(ctx),
            identity: self.identity.clone(),
            session_id: self.session_id.clone(),
            handle,
            events,
            cancel: self.cancel.clone(),
            status: SessionStatus::CodeGenerated,
            timer: Some(Timer::PairingDeadline(
                Instant::now() + ctx.config.pairing_deadline,
            )),
        };
        let started = SessionStarted {
            session_id: self.session_id.clone(),
            pairing_code: code,
            attempts: created.attempts,
        };
        Ok((started, driver, pending))
    }

    /// Ask for a code, accepting one the connector pushes first.
    ///
    /// Unrelated events that arrive meanwhile are kept for the driver.
    async fn obtain_code(
        &self,
        handle: &dyn ConnectorHandle,
        events: &mut mpsc::Receiver<ConnectorEvent>,
    ) -> Result<(String, Vec<ConnectorEvent>), LinkError> {
        let mut pending = Vec::new();
        let request = handle.request_pairing_code(&self.identity);
        tokio::pin!(request);
        let deadline = tokio::time::sleep(self.ctx.config.request_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(LinkError::Cancelled),
                event = events.recv() => match event {
                    Some(ConnectorEvent::PairingCodeReady(code)) => {
                        debug!("connector pushed pairing code");
                        return Ok((code, pending));
                    }
                    Some(ConnectorEvent::ConnectionClose { reason }) => {
                        return Err(LinkError::PairingRequest(format!(
                            "connection closed before a code was issued: {reason}"
                        )));
                    }
                    Some(other) => {
                        let _ = self.ctx.registry.touch(&self.identity, &self.session_id);
                        pending.push(other);
                    }
                    None => {
                        return Err(LinkError::PairingRequest(
                            "connector event stream ended".into(),
                        ));
                    }
                },
                result = &mut request => {
                    return result
                        .map(|code| (code, pending))
                        .map_err(|e| LinkError::PairingRequest(e.to_string()));
                }
                () = &mut deadline => {
                    return Err(LinkError::PairingRequest(format!(
                        "no pairing code within {}ms",
                        self.ctx.config.request_timeout.as_millis()
                    )));
                }
            }
        }
    }

    fn advance(&self, next: SessionStatus) -> Result<(), LinkError> {
        match self
            .ctx
            .registry
            .transition(&self.identity, &self.session_id, next)
        {
            Ok(_) => {
                debug!(status = %next, "session status changed");
                Ok(())
            }
            // the session was torn down underneath us
            Err(TransitionError::NotFound) => Err(LinkError::Cancelled),
            Err(TransitionError::Forbidden { from, to }) => Err(LinkError::Cleanup(format!(
                "unexpected transition {from} -> {to}"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Timer {
    PairingDeadline(Instant),
    Settle(Instant),
    Grace(Instant),
}

impl Timer {
    fn at(self) -> Instant {
        match self {
            Self::PairingDeadline(at) | Self::Settle(at) | Self::Grace(at) => at,
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

enum Step {
    Moved,
    Refused,
    Gone,
}

/// Sole consumer of one session's events and timers.
struct SessionDriver {
    ctx: Arc<SessionContext>,
    identity: Identity,
    session_id: SessionId,
    handle: Arc<dyn ConnectorHandle>,
    events: mpsc::Receiver<ConnectorEvent>,
    cancel: CancellationToken,
    status: SessionStatus,
    timer: Option<Timer>,
}

impl SessionDriver {
    async fn run(mut self, pending: Vec<ConnectorEvent>) {
        for event in pending {
            if let Flow::Stop = self.on_event(event).await {
                return;
            }
        }

        loop {
            let wake = self
                .timer
                .map_or_else(|| Instant::now() + FAR_FUTURE, Timer::at);
            let flow = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    debug!("session torn down elsewhere, driver exiting");
                    Flow::Stop
                }
                () = tokio::time::sleep_until(wake), if self.timer.is_some() => {
                    self.on_timer().await
                }
                event = self.events.recv() => {
                    let event = event.unwrap_or_else(|| ConnectorEvent::ConnectionClose {
                        reason: "event stream ended".into(),
                    });
                    self.on_event(event).await
                }
            };
            if let Flow::Stop = flow {
                return;
            }
        }
    }

    async fn on_event(&mut self, event: ConnectorEvent) -> Flow {
        match event {
            event @ (ConnectorEvent::QrReceived | ConnectorEvent::CredentialsUpdated) => {
                debug!(?event, "connector activity");
                let _ = self.ctx.registry.touch(&self.identity, &self.session_id);
                Flow::Continue
            }
            ConnectorEvent::PairingCodeReady(code) => {
                debug!("pairing code refreshed");
                let _ = self
                    .ctx
                    .registry
                    .set_pairing_code(&self.identity, &self.session_id, &code);
                Flow::Continue
            }
            ConnectorEvent::ConnectionOpen => self.on_open(),
            ConnectorEvent::ConnectionClose { reason } => self.on_close(&reason).await,
        }
    }

    fn on_open(&mut self) -> Flow {
        if self.status == SessionStatus::CodeGenerated {
            match self.advance(SessionStatus::Connecting) {
                Step::Moved => {}
                Step::Refused => return Flow::Continue,
                Step::Gone => return Flow::Stop,
            }
        }
        if self.status != SessionStatus::Connecting {
            debug!(status = %self.status, "ignoring open event");
            return Flow::Continue;
        }
        match self.advance(SessionStatus::Connected) {
            Step::Moved => {
                self.timer = Some(Timer::Settle(Instant::now() + self.ctx.config.settle_delay));
                Flow::Continue
            }
            Step::Refused => Flow::Continue,
            Step::Gone => Flow::Stop,
        }
    }

    async fn on_close(&mut self, reason: &str) -> Flow {
        if self.status == SessionStatus::Completed {
            info!(reason, "link closed after completion");
            self.finish(CleanupReason::Completed).await;
            return Flow::Stop;
        }
        warn!(reason, status = %self.status, "link dropped before completion");
        if let Step::Gone = self.advance(SessionStatus::Disconnected) {
            return Flow::Stop;
        }
        self.finish(CleanupReason::Disconnected).await;
        Flow::Stop
    }

    async fn on_timer(&mut self) -> Flow {
        match self.timer.take() {
            Some(Timer::PairingDeadline(_)) => {
                warn!(
                    deadline_ms = self.ctx.config.pairing_deadline.as_millis(),
                    "device did not link before the pairing deadline"
                );
                if let Step::Gone = self.advance(SessionStatus::TimedOut) {
                    return Flow::Stop;
                }
                self.finish(CleanupReason::TimedOut).await;
                Flow::Stop
            }
            Some(Timer::Settle(_)) => {
                let delivered = tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => return Flow::Stop,
                    result = self.deliver() => result,
                };
                match delivered {
                    Ok(()) => info!("credentials delivered"),
                    Err(e) => warn!(error = %e, category = e.category(), "credential delivery failed"),
                }
                match self.advance(SessionStatus::Completed) {
                    Step::Gone => Flow::Stop,
                    Step::Moved | Step::Refused => {
                        self.timer =
                            Some(Timer::Grace(Instant::now() + self.ctx.config.completion_grace));
                        Flow::Continue
                    }
                }
            }
            Some(Timer::Grace(_)) => {
                self.finish(CleanupReason::Completed).await;
                Flow::Stop
            }
            None => Flow::Continue,
        }
    }

    /// Snapshot credentials and send them, base64-encoded, to the device.
    async fn deliver(&self) -> Result<(), LinkError> {
        let limit = self.ctx.config.request_timeout;
        let snapshot = tokio::time::timeout(limit, self.handle.snapshot_credentials())
            .await
            .map_err(|_| LinkError::Delivery("credential snapshot timed out".into()))?
            .map_err(|e| LinkError::Delivery(e.to_string()))?;

        let message = self.ctx.config.delivery.render(&BASE64.encode(&snapshot));
        tokio::time::timeout(
            limit,
            self.handle.send_payload(&self.identity, message.as_bytes()),
        )
        .await
        .map_err(|_| LinkError::Delivery("payload send timed out".into()))?
        .map_err(|e| LinkError::Delivery(e.to_string()))
    }

    fn advance(&mut self, next: SessionStatus) -> Step {
        match self
            .ctx
            .registry
            .transition(&self.identity, &self.session_id, next)
        {
            Ok(_) => {
                info!(from = %self.status, to = %next, "session status changed");
                self.status = next;
                Step::Moved
            }
            Err(TransitionError::NotFound) => Step::Gone,
            Err(TransitionError::Forbidden { from, to }) => {
                debug!(%from, %to, "transition refused");
                Step::Refused
            }
        }
    }

    async fn finish(&self, reason: CleanupReason) {
        let _ = self
            .ctx
            .cleanup(&self.identity, Some(&self.session_id), reason)
            .await;
    }
}

const FAR_FUTURE: std::time::Duration = std::time::Duration::from_secs(86_400 * 365);
