//! Connector creation with bounded retries.
//!
//! Each attempt is raced against the per-attempt timeout. A failed or timed
//! out attempt discards whatever the connector left in the identity's
//! credential directory before the next one starts, so every attempt begins
//! from a clean slate.

use std::path::PathBuf;
use std::sync::Arc;

use pairlink_core::{Identity, LinkError, RetryConfig};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connector::{Connector, ConnectorLink};
use crate::credentials::CredentialStore;

/// A link plus the bookkeeping the lifecycle records about it.
#[derive(Debug)]
pub struct CreatedConnection {
    /// The live link.
    pub link: ConnectorLink,
    /// Attempts consumed, including the successful one.
    pub attempts: u32,
    /// Directory handed to the connector.
    pub credential_dir: PathBuf,
}

/// Builds connector links for identities.
pub struct ClientFactory {
    connector: Arc<dyn Connector>,
    store: CredentialStore,
    retry: RetryConfig,
}

impl ClientFactory {
    /// Factory using `connector`, storing credentials in `store`.
    pub fn new(connector: Arc<dyn Connector>, store: CredentialStore, retry: RetryConfig) -> Self {
        Self {
            connector,
            store,
            retry,
        }
    }

    /// Default retry configuration.
    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    /// Create a link using the factory's retry configuration.
    pub async fn create_connection(
        &self,
        identity: &Identity,
        cancel: &CancellationToken,
    ) -> Result<CreatedConnection, LinkError> {
        self.create_connection_with(identity, &self.retry, cancel)
            .await
    }

    /// Create a link with an explicit retry configuration.
    ///
    /// Fails with [`LinkError::ConnectionCreation`] once `max_attempts` are
    /// spent, or [`LinkError::Cancelled`] as soon as `cancel` fires.
    pub async fn create_connection_with(
        &self,
        identity: &Identity,
        retry: &RetryConfig,
        cancel: &CancellationToken,
    ) -> Result<CreatedConnection, LinkError> {
        let max_attempts = retry.max_attempts.max(1);
        let attempt_timeout = retry.attempt_timeout();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(LinkError::Cancelled);
            }
            debug!(identity = %identity, attempt, max_attempts, "creating connector");

            match self.attempt(identity, attempt_timeout, cancel).await {
                Attempt::Created(link, credential_dir) => {
                    info!(identity = %identity, attempt, "connector created");
                    return Ok(CreatedConnection {
                        link,
                        attempts: attempt,
                        credential_dir,
                    });
                }
                Attempt::Cancelled => {
                    self.discard(identity).await;
                    return Err(LinkError::Cancelled);
                }
                Attempt::Failed(error) => {
                    warn!(identity = %identity, attempt, max_attempts, error = %error, "connector creation attempt failed");
                    last_error = error;
                    self.discard(identity).await;
                }
            }

            if attempt < max_attempts {
                let delay = retry.backoff.delay_for(attempt);
                debug!(identity = %identity, delay_ms = delay.as_millis(), "backing off before retry");
                tokio::select! {
                    () = cancel.cancelled() => return Err(LinkError::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }

        Err(LinkError::ConnectionCreation {
            attempts: max_attempts,
            last_error,
        })
    }

    async fn attempt(
        &self,
        identity: &Identity,
        attempt_timeout: std::time::Duration,
        cancel: &CancellationToken,
    ) -> Attempt {
        let dir = match self.store.prepare(identity).await {
            Ok(dir) => dir,
            Err(e) => return Attempt::Failed(format!("credential directory unavailable: {e}")),
        };

        let create = tokio::time::timeout(
            attempt_timeout,
            self.connector.create_connection(identity, &dir),
        );
        tokio::select! {
            () = cancel.cancelled() => Attempt::Cancelled,
            outcome = create => match outcome {
                Ok(Ok(link)) => Attempt::Created(link, dir),
                Ok(Err(e)) => Attempt::Failed(e.to_string()),
                Err(_) => Attempt::Failed(format!(
                    "attempt timed out after {}ms",
                    attempt_timeout.as_millis()
                )),
            },
        }
    }

    async fn discard(&self, identity: &Identity) {
        if let Err(e) = self.store.discard(identity).await {
            warn!(identity = %identity, error = %e, "failed to discard partial credentials");
        }
    }
}

enum Attempt {
    Created(ConnectorLink, PathBuf),
    Failed(String),
    Cancelled,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use pairlink_core::{BackoffPolicy, BackoffStrategy};
    use tokio::time::Instant;

    use super::*;
    use crate::testing::FakeConnector;

    fn who() -> Identity {
        Identity::parse("15551234567").unwrap()
    }

    fn retry(max_attempts: u32, timeout_ms: u64) -> RetryConfig {
        RetryConfig {
            max_attempts,
            attempt_timeout_ms: timeout_ms,
            backoff: BackoffPolicy {
                strategy: BackoffStrategy::Linear,
                base_delay_ms: 1_000,
                max_delay_ms: 10_000,
            },
        }
    }

    fn factory(fake: &FakeConnector, root: &std::path::Path, config: RetryConfig) -> ClientFactory {
        ClientFactory::new(Arc::new(fake.clone()), CredentialStore::new(root), config)
    }

    #[tokio::test(start_paused = true)]
    async fn first_attempt_success() {
        let tmp = tempfile::tempdir().unwrap();
        let fake = FakeConnector::new();
        let f = factory(&fake, tmp.path(), retry(3, 5_000));

        let created = f
            .create_connection(&who(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(created.attempts, 1);
        assert_eq!(created.credential_dir, tmp.path().join("15551234567"));
        assert!(created.credential_dir.is_dir());
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let tmp = tempfile::tempdir().unwrap();
        let fake = FakeConnector::new().failing_first(2);
        let f = factory(&fake, tmp.path(), retry(3, 5_000));

        let created = f
            .create_connection(&who(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(created.attempts, 3);
        assert_eq!(fake.creates_for(&who()), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_attempts_with_last_error() {
        let tmp = tempfile::tempdir().unwrap();
        let fake = FakeConnector::new().failing_first(10);
        let f = factory(&fake, tmp.path(), retry(2, 5_000));

        let err = f
            .create_connection(&who(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_matches!(
            err,
            LinkError::ConnectionCreation { attempts: 2, ref last_error } if last_error.contains("scripted failure")
        );
        assert_eq!(fake.creates_for(&who()), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_connector_bounded_per_attempt_with_growing_backoff() {
        let tmp = tempfile::tempdir().unwrap();
        let fake = FakeConnector::new().hanging_create();
        let f = factory(&fake, tmp.path(), retry(3, 2_000));

        let started = Instant::now();
        let err = f
            .create_connection(&who(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_matches!(err, LinkError::ConnectionCreation { attempts: 3, ref last_error } if last_error.contains("timed out"));
        let times = fake.create_times();
        assert_eq!(times.len(), 3);

        // attempt 1 at 0s, times out at 2s, waits 1s; attempt 2 at 3s,
        // times out at 5s, waits 2s; attempt 3 at 7s, times out at 9s
        let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
        assert_close(gaps[0], Duration::from_secs(3));
        assert_close(gaps[1], Duration::from_secs(4));
        let backoffs: Vec<Duration> = gaps.iter().map(|g| *g - Duration::from_secs(2)).collect();
        assert!(backoffs[0] < backoffs[1]);
        assert_close(started.elapsed(), Duration::from_secs(9));
    }

    fn assert_close(actual: Duration, expected: Duration) {
        let slack = Duration::from_millis(50);
        assert!(
            actual >= expected && actual <= expected + slack,
            "expected ~{expected:?}, got {actual:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempts_discard_partial_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        let fake = FakeConnector::new().failing_first(5);
        let f = factory(&fake, tmp.path(), retry(2, 5_000));

        let _ = f
            .create_connection(&who(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(!tmp.path().join("15551234567").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_retrying() {
        let tmp = tempfile::tempdir().unwrap();
        let fake = FakeConnector::new().hanging_create();
        let f = factory(&fake, tmp.path(), retry(5, 60_000));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        let _ = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let err = f.create_connection(&who(), &cancel).await.unwrap_err();
        assert_eq!(err, LinkError::Cancelled);
        assert_eq!(fake.creates_for(&who()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempts_treated_as_one() {
        let tmp = tempfile::tempdir().unwrap();
        let fake = FakeConnector::new().failing_first(1);
        let f = factory(&fake, tmp.path(), retry(0, 5_000));
        let err = f
            .create_connection(&who(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_matches!(err, LinkError::ConnectionCreation { attempts: 1, .. });
    }
}
