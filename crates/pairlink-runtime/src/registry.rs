//! Authoritative map from identity to session.
//!
//! Every operation takes the same mutex, so claim, lookup, and removal are
//! atomic with respect to each other. Nothing here awaits; connector I/O
//! happens outside the lock.
//!
//! Removal is two-phase. [`SessionRegistry::remove`] marks the entry as
//! releasing and hands the connector handle to exactly one caller; the entry
//! stays in the map (invisible to lookups, still blocking new claims) until
//! [`SessionRegistry::release`] drops it once the handle is closed and the
//! credential directory is gone. That keeps a new session for the same
//! identity from sharing a directory with the teardown of the previous one.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use pairlink_core::{Identity, LinkError, SessionId, SessionStatus};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::connector::ConnectorHandle;

/// Point-in-time copy of a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Normalized identity.
    pub identity: Identity,
    /// Generation id.
    pub session_id: SessionId,
    /// Current status.
    pub status: SessionStatus,
    /// Pairing code, once issued.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pairing_code: Option<String>,
    /// Claim time.
    pub created_at: DateTime<Utc>,
    /// Last status change or connector activity.
    pub last_updated: DateTime<Utc>,
    /// Connector-creation attempts consumed.
    pub retry_count: u32,
}

/// Returned by a successful [`SessionRegistry::register`].
#[derive(Clone, Debug)]
pub struct Claim {
    /// Generation id of the new session.
    pub session_id: SessionId,
    /// Cancelled when the session is torn down.
    pub cancel: CancellationToken,
}

/// What the single winning remover must release.
pub struct Teardown {
    /// The record as it was just before removal.
    pub record: SessionRecord,
    /// Connector handle, if one was attached.
    pub handle: Option<Arc<dyn ConnectorHandle>>,
    /// The session's cancellation token.
    pub cancel: CancellationToken,
}

impl std::fmt::Debug for Teardown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Teardown")
            .field("record", &self.record)
            .field("has_handle", &self.handle.is_some())
            .finish_non_exhaustive()
    }
}

/// Why a status change was refused.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    /// No live session with that identity and generation.
    #[error("session not found")]
    NotFound,
    /// The transition table forbids the move.
    #[error("transition {from} -> {to} not allowed")]
    Forbidden {
        /// Current status.
        from: SessionStatus,
        /// Requested status.
        to: SessionStatus,
    },
}

struct Entry {
    record: SessionRecord,
    handle: Option<Arc<dyn ConnectorHandle>>,
    cancel: CancellationToken,
    last_activity: Instant,
    releasing: bool,
}

impl Entry {
    fn is_live(&self, session_id: &SessionId) -> bool {
        !self.releasing && &self.record.session_id == session_id
    }

    fn touch(&mut self) {
        self.record.last_updated = Utc::now();
        self.last_activity = Instant::now();
    }

    fn take(&mut self) -> Teardown {
        let record = self.record.clone();
        self.releasing = true;
        self.record.status = SessionStatus::CleanedUp;
        self.touch();
        Teardown {
            record,
            handle: self.handle.take(),
            cancel: self.cancel.clone(),
        }
    }
}

/// Registry of in-flight sessions, at most one per identity.
pub struct SessionRegistry {
    entries: Mutex<HashMap<Identity, Entry>>,
    capacity: usize,
    // only read or written with `entries` locked
    closed: AtomicBool,
}

impl SessionRegistry {
    /// Empty registry holding at most `capacity` sessions.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    /// Claim `identity` with a fresh `Initializing` session.
    ///
    /// Fails with `Cancelled` once the registry is closed.
    pub fn register(&self, identity: &Identity) -> Result<Claim, LinkError> {
        let mut entries = self.entries.lock();
        if self.closed.load(Ordering::Relaxed) {
            return Err(LinkError::Cancelled);
        }
        if entries.contains_key(identity) {
            return Err(LinkError::Conflict(identity.to_string()));
        }
        if entries.len() >= self.capacity {
            return Err(LinkError::Capacity {
                limit: self.capacity,
            });
        }
        let now = Utc::now();
        let claim = Claim {
            session_id: SessionId::new(),
            cancel: CancellationToken::new(),
        };
        let entry = Entry {
            record: SessionRecord {
                identity: identity.clone(),
                session_id: claim.session_id.clone(),
                status: SessionStatus::Initializing,
                pairing_code: None,
                created_at: now,
                last_updated: now,
                retry_count: 0,
            },
            handle: None,
            cancel: claim.cancel.clone(),
            last_activity: Instant::now(),
            releasing: false,
        };
        let _ = entries.insert(identity.clone(), entry);
        Ok(claim)
    }

    /// Current record for `identity`, if a live session exists.
    pub fn get(&self, identity: &Identity) -> Option<SessionRecord> {
        self.entries
            .lock()
            .get(identity)
            .filter(|e| !e.releasing)
            .map(|e| e.record.clone())
    }

    /// Move the session to `next`, returning the previous status.
    pub fn transition(
        &self,
        identity: &Identity,
        session_id: &SessionId,
        next: SessionStatus,
    ) -> Result<SessionStatus, TransitionError> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(identity)
            .filter(|e| e.is_live(session_id))
            .ok_or(TransitionError::NotFound)?;
        let from = entry.record.status;
        if !from.can_transition_to(next) {
            return Err(TransitionError::Forbidden { from, to: next });
        }
        entry.record.status = next;
        entry.touch();
        Ok(from)
    }

    /// Record the issued pairing code.
    pub fn set_pairing_code(&self, identity: &Identity, session_id: &SessionId, code: &str) -> bool {
        self.update(identity, session_id, |e| {
            e.record.pairing_code = Some(code.to_owned());
        })
    }

    /// Record how many creation attempts were consumed.
    pub fn set_retry_count(&self, identity: &Identity, session_id: &SessionId, count: u32) -> bool {
        self.update(identity, session_id, |e| e.record.retry_count = count)
    }

    /// Note connector activity without changing status.
    pub fn touch(&self, identity: &Identity, session_id: &SessionId) -> bool {
        self.update(identity, session_id, |_| {})
    }

    /// Hand the connector handle to the session.
    ///
    /// If the session was torn down in the meantime the handle is given back
    /// and the caller is responsible for closing it.
    pub fn attach_handle(
        &self,
        identity: &Identity,
        session_id: &SessionId,
        handle: Arc<dyn ConnectorHandle>,
    ) -> Result<(), Arc<dyn ConnectorHandle>> {
        let mut entries = self.entries.lock();
        match entries.get_mut(identity).filter(|e| e.is_live(session_id)) {
            Some(entry) => {
                entry.handle = Some(handle);
                entry.touch();
                Ok(())
            }
            None => Err(handle),
        }
    }

    /// Begin removing `identity`.
    ///
    /// With `expected`, only that generation is removed. Returns `None` when
    /// there is nothing to remove or another caller already won; the caller
    /// that gets `Some` must finish with [`Self::release`].
    pub fn remove(&self, identity: &Identity, expected: Option<&SessionId>) -> Option<Teardown> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(identity)?;
        if entry.releasing || expected.is_some_and(|id| id != &entry.record.session_id) {
            return None;
        }
        Some(entry.take())
    }

    /// Begin removing the session only if it is still idle past `max_age` and
    /// its status is not protected from expiry.
    pub fn remove_stale(
        &self,
        identity: &Identity,
        session_id: &SessionId,
        max_age: Duration,
    ) -> Option<Teardown> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(identity).filter(|e| e.is_live(session_id))?;
        if entry.record.status.is_reap_protected() || entry.last_activity.elapsed() <= max_age {
            return None;
        }
        Some(entry.take())
    }

    /// Drop the releasing entry for this generation.
    pub fn release(&self, identity: &Identity, session_id: &SessionId) -> bool {
        let mut entries = self.entries.lock();
        let releasable = entries
            .get(identity)
            .is_some_and(|e| e.releasing && &e.record.session_id == session_id);
        if releasable {
            let _ = entries.remove(identity);
        }
        releasable
    }

    /// Live sessions idle longer than `max_age` whose status allows expiry.
    pub fn stale(&self, max_age: Duration) -> Vec<(Identity, SessionId)> {
        self.entries
            .lock()
            .values()
            .filter(|e| {
                !e.releasing
                    && !e.record.status.is_reap_protected()
                    && e.last_activity.elapsed() > max_age
            })
            .map(|e| (e.record.identity.clone(), e.record.session_id.clone()))
            .collect()
    }

    /// Refuse further claims and return every live session.
    ///
    /// Both happen under one lock, so no claim can land after the snapshot.
    pub fn close(&self) -> Vec<SessionRecord> {
        let entries = self.entries.lock();
        self.closed.store(true, Ordering::Relaxed);
        entries
            .values()
            .filter(|e| !e.releasing)
            .map(|e| e.record.clone())
            .collect()
    }

    /// Copies of every live session.
    pub fn snapshot(&self) -> Vec<SessionRecord> {
        self.entries
            .lock()
            .values()
            .filter(|e| !e.releasing)
            .map(|e| e.record.clone())
            .collect()
    }

    /// Number of live sessions.
    pub fn active_count(&self) -> usize {
        self.entries.lock().values().filter(|e| !e.releasing).count()
    }

    /// Number of entries, including ones still being released.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the registry holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Configured session limit.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn update(
        &self,
        identity: &Identity,
        session_id: &SessionId,
        f: impl FnOnce(&mut Entry),
    ) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(identity).filter(|e| e.is_live(session_id)) {
            Some(entry) => {
                f(entry);
                entry.touch();
                true
            }
            None => false,
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pairlink_core::SessionStatus::*;

    use crate::testing::FakeHandle;

    fn id(raw: &str) -> Identity {
        Identity::parse(raw).unwrap()
    }

    // ── register ────────────────────────────────────────────────────

    #[test]
    fn register_creates_initializing_record() {
        let reg = SessionRegistry::default();
        let claim = reg.register(&id("15551234567")).unwrap();
        let record = reg.get(&id("15551234567")).unwrap();
        assert_eq!(record.status, Initializing);
        assert_eq!(record.session_id, claim.session_id);
        assert!(record.pairing_code.is_none());
        assert_eq!(record.retry_count, 0);
    }

    #[test]
    fn close_refuses_new_claims_and_returns_live_sessions() {
        let reg = SessionRegistry::default();
        let _ = reg.register(&id("15551234567")).unwrap();
        let open = reg.close();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].identity, id("15551234567"));
        assert_matches!(reg.register(&id("15557654321")), Err(LinkError::Cancelled));
        assert_eq!(reg.active_count(), 1);
    }

    #[test]
    fn second_register_conflicts() {
        let reg = SessionRegistry::default();
        let _ = reg.register(&id("15551234567")).unwrap();
        assert_matches!(
            reg.register(&id("+1 555 123 4567")),
            Err(LinkError::Conflict(ref who)) if who == "15551234567"
        );
    }

    #[test]
    fn concurrent_register_has_one_winner() {
        let reg = SessionRegistry::default();
        let identity = id("15551234567");
        let wins = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..32)
                .map(|_| scope.spawn(|| reg.register(&identity).is_ok()))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count()
        });
        assert_eq!(wins, 1);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn capacity_enforced() {
        let reg = SessionRegistry::new(2);
        let _ = reg.register(&id("1000001")).unwrap();
        let _ = reg.register(&id("1000002")).unwrap();
        assert_matches!(
            reg.register(&id("1000003")),
            Err(LinkError::Capacity { limit: 2 })
        );
    }

    // ── transitions ─────────────────────────────────────────────────

    #[test]
    fn transition_follows_table() {
        let reg = SessionRegistry::default();
        let who = id("15551234567");
        let claim = reg.register(&who).unwrap();
        assert_eq!(reg.transition(&who, &claim.session_id, Requesting), Ok(Initializing));
        assert_eq!(
            reg.transition(&who, &claim.session_id, Connected),
            Err(TransitionError::Forbidden {
                from: Requesting,
                to: Connected
            })
        );
        assert_eq!(reg.get(&who).unwrap().status, Requesting);
    }

    #[test]
    fn transition_for_stale_generation_not_found() {
        let reg = SessionRegistry::default();
        let who = id("15551234567");
        let _ = reg.register(&who).unwrap();
        assert_eq!(
            reg.transition(&who, &SessionId::new(), Requesting),
            Err(TransitionError::NotFound)
        );
    }

    #[test]
    fn pairing_code_and_retry_count_recorded() {
        let reg = SessionRegistry::default();
        let who = id("15551234567");
        let claim = reg.register(&who).unwrap();
        assert!(reg.set_pairing_code(&who, &claim.session_id, "ABC123"));
        assert!(reg.set_retry_count(&who, &claim.session_id, 2));
        let record = reg.get(&who).unwrap();
        assert_eq!(record.pairing_code.as_deref(), Some("ABC123"));
        assert_eq!(record.retry_count, 2);
    }

    // ── removal ─────────────────────────────────────────────────────

    #[test]
    fn remove_absent_is_noop() {
        let reg = SessionRegistry::default();
        assert!(reg.remove(&id("15551234567"), None).is_none());
    }

    #[test]
    fn remove_hands_out_handle_once() {
        let reg = SessionRegistry::default();
        let who = id("15551234567");
        let claim = reg.register(&who).unwrap();
        reg.attach_handle(&who, &claim.session_id, Arc::new(FakeHandle::default()))
            .ok()
            .unwrap();

        let first = reg.remove(&who, None).unwrap();
        assert!(first.handle.is_some());
        assert_eq!(first.record.status, Initializing);
        assert!(reg.remove(&who, None).is_none());
        assert!(reg.get(&who).is_none());
    }

    #[test]
    fn releasing_entry_blocks_new_claims_until_released() {
        let reg = SessionRegistry::default();
        let who = id("15551234567");
        let claim = reg.register(&who).unwrap();
        let _ = reg.remove(&who, None).unwrap();
        assert_matches!(reg.register(&who), Err(LinkError::Conflict(_)));
        assert_eq!(reg.active_count(), 0);

        assert!(reg.release(&who, &claim.session_id));
        assert!(reg.register(&who).is_ok());
    }

    #[test]
    fn remove_with_wrong_generation_ignored() {
        let reg = SessionRegistry::default();
        let who = id("15551234567");
        let _ = reg.register(&who).unwrap();
        assert!(reg.remove(&who, Some(&SessionId::new())).is_none());
        assert!(reg.get(&who).is_some());
    }

    #[test]
    fn attach_after_removal_returns_handle() {
        let reg = SessionRegistry::default();
        let who = id("15551234567");
        let claim = reg.register(&who).unwrap();
        let _ = reg.remove(&who, None).unwrap();
        let back = reg.attach_handle(&who, &claim.session_id, Arc::new(FakeHandle::default()));
        assert!(back.is_err());
    }

    #[test]
    fn transitions_refused_while_releasing() {
        let reg = SessionRegistry::default();
        let who = id("15551234567");
        let claim = reg.register(&who).unwrap();
        let _ = reg.remove(&who, None).unwrap();
        assert_eq!(
            reg.transition(&who, &claim.session_id, Requesting),
            Err(TransitionError::NotFound)
        );
    }

    // ── staleness ───────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn stale_skips_protected_statuses() {
        let reg = SessionRegistry::default();
        let stuck = id("1000001");
        let linked = id("1000002");
        let _ = reg.register(&stuck).unwrap();
        let claim = reg.register(&linked).unwrap();
        for next in [Requesting, CodeGenerated, Connecting, Connected] {
            let _ = reg.transition(&linked, &claim.session_id, next).unwrap();
        }

        tokio::time::advance(Duration::from_secs(61)).await;
        let stale = reg.stale(Duration::from_secs(60));
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].0, stuck);
        assert!(reg.remove_stale(&linked, &claim.session_id, Duration::from_secs(60)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn touch_resets_age() {
        let reg = SessionRegistry::default();
        let who = id("15551234567");
        let claim = reg.register(&who).unwrap();
        tokio::time::advance(Duration::from_secs(50)).await;
        assert!(reg.touch(&who, &claim.session_id));
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(reg.stale(Duration::from_secs(60)).is_empty());
        assert!(reg.remove_stale(&who, &claim.session_id, Duration::from_secs(60)).is_none());
    }

    #[test]
    fn snapshot_excludes_releasing() {
        let reg = SessionRegistry::default();
        let _ = reg.register(&id("1000001")).unwrap();
        let _ = reg.register(&id("1000002")).unwrap();
        let _ = reg.remove(&id("1000001"), None).unwrap();
        let snap = reg.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].identity, id("1000002"));
        assert_eq!(reg.len(), 2);
    }
}
