//! Periodic eviction of stale sessions.
//!
//! A session is stale when it has seen no status change or connector
//! activity for longer than `max_age`. `Connected` and `Completed` sessions
//! are never evicted: they are about to finish on their own.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::context::{CleanupReason, SessionContext};

/// Expiry sweep over the registry.
pub struct ExpiryReaper {
    ctx: Arc<SessionContext>,
    interval: Duration,
    max_age: Duration,
}

impl ExpiryReaper {
    /// Sweep every `interval`, evicting sessions idle longer than `max_age`.
    pub fn new(ctx: Arc<SessionContext>, interval: Duration, max_age: Duration) -> Self {
        Self {
            ctx,
            interval,
            max_age,
        }
    }

    /// Run one sweep and return how many sessions it evicted.
    pub async fn sweep(&self) -> usize {
        let candidates = self.ctx.registry.stale(self.max_age);
        if candidates.is_empty() {
            return 0;
        }
        debug!(candidates = candidates.len(), "expiry sweep found stale sessions");

        let evictions = candidates.into_iter().map(|(identity, session_id)| {
            let ctx = Arc::clone(&self.ctx);
            let max_age = self.max_age;
            async move {
                // re-checked under the lock; the session may have moved on
                match ctx.registry.remove_stale(&identity, &session_id, max_age) {
                    Some(teardown) => {
                        ctx.teardown(teardown, CleanupReason::Expired).await;
                        true
                    }
                    None => false,
                }
            }
        });
        let evicted = futures::future::join_all(evictions)
            .await
            .into_iter()
            .filter(|evicted| *evicted)
            .count();
        if evicted > 0 {
            info!(evicted, "expiry sweep evicted sessions");
        }
        evicted
    }

    /// Sweep until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        let _ = ticker.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("expiry sweep stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let _ = self.sweep().await;
                }
            }
        }
    }

    /// Spawn [`Self::run`] on the current runtime.
    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}
