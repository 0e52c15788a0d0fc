//! Graceful shutdown coordination via `CancellationToken`.
//!
//! Cancelling the token stops the expiry sweep, the HTTP listener, and new
//! session starts. [`ShutdownCoordinator::drain`] then tears down every
//! remaining session concurrently, each under its own deadline, so one stuck
//! connector cannot hold the process open.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::context::{CleanupReason, SessionContext};

/// Default per-session bound for the drain.
const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(5);

/// Tally of a drain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Sessions present when the drain started.
    pub total: usize,
    /// Sessions torn down by the drain.
    pub completed: usize,
    /// Sessions another path had already torn down.
    pub skipped: usize,
    /// Sessions whose teardown exceeded the per-session bound.
    pub timed_out: usize,
}

/// Coordinates shutdown across the broker's tasks.
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a coordinator with a fresh token.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Coordinator driving an existing token.
    pub fn with_token(token: CancellationToken) -> Self {
        Self { token }
    }

    /// A clone of the shutdown token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Signal shutdown. Idempotent.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether shutdown has been signalled.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Signal shutdown, close the registry to new claims, and tear down
    /// every session in `ctx`.
    ///
    /// Each teardown gets at most `per_session` (default 5s). Failures and
    /// timeouts are logged and counted, never returned.
    pub async fn drain(
        &self,
        ctx: &Arc<SessionContext>,
        per_session: Option<Duration>,
    ) -> DrainReport {
        let per_session = per_session.unwrap_or(DEFAULT_SESSION_TIMEOUT);
        self.shutdown();

        let identities: Vec<_> = ctx
            .registry
            .close()
            .into_iter()
            .map(|record| record.identity)
            .collect();
        info!(
            sessions = identities.len(),
            timeout_ms = per_session.as_millis(),
            "draining sessions"
        );

        let cleanups = identities.iter().map(|identity| async move {
            let outcome = tokio::time::timeout(
                per_session,
                ctx.cleanup(identity, None, CleanupReason::Shutdown),
            )
            .await;
            if outcome.is_err() {
                warn!(identity = %identity, "session cleanup timed out during shutdown");
            }
            outcome
        });
        let outcomes = futures::future::join_all(cleanups).await;

        let mut report = DrainReport {
            total: identities.len(),
            ..DrainReport::default()
        };
        for outcome in outcomes {
            match outcome {
                Ok(true) => report.completed += 1,
                Ok(false) => report.skipped += 1,
                Err(_) => report.timed_out += 1,
            }
        }
        info!(
            completed = report.completed,
            skipped = report.skipped,
            timed_out = report.timed_out,
            "session drain finished"
        );
        report
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_not_shutting_down() {
        assert!(!ShutdownCoordinator::new().is_shutting_down());
    }

    #[test]
    fn shutdown_is_idempotent_and_propagates() {
        let coord = ShutdownCoordinator::default();
        let t1 = coord.token();
        let t2 = coord.token();
        coord.shutdown();
        coord.shutdown();
        assert!(coord.is_shutting_down());
        assert!(t1.is_cancelled());
        assert!(t2.is_cancelled());
    }

    #[test]
    fn with_token_shares_cancellation() {
        let token = CancellationToken::new();
        let coord = ShutdownCoordinator::with_token(token.clone());
        coord.shutdown();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_future_resolves() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();
        let waiter = tokio::spawn(async move {
            token.cancelled().await;
            true
        });
        coord.shutdown();
        assert!(waiter.await.unwrap());
    }
}
