//! State shared by every session driver, the expiry sweep, and shutdown.
//!
//! [`SessionContext::cleanup`] is the one teardown path. Completion, timeout,
//! disconnect, caller requests, the sweep, and shutdown all funnel through it,
//! and the registry's removal gate makes sure only the first caller closes the
//! handle.

use std::fmt;
use std::time::Duration;

use pairlink_core::{Identity, IdentityRules, SessionId};
use pairlink_settings::{DeliverySettings, PairlinkSettings};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::credentials::CredentialStore;
use crate::factory::ClientFactory;
use crate::registry::{SessionRegistry, Teardown};

/// Timing and policy knobs for session drivers.
#[derive(Clone, Debug)]
pub struct LifecycleConfig {
    /// Code issuance to link-up deadline.
    pub pairing_deadline: Duration,
    /// Link-up to delivery delay.
    pub settle_delay: Duration,
    /// Delivery to teardown delay.
    pub completion_grace: Duration,
    /// Bound on pairing-code requests and each delivery step.
    pub request_timeout: Duration,
    /// Bound on closing a handle.
    pub close_timeout: Duration,
    /// Identity validation bounds.
    pub identity_rules: IdentityRules,
    /// Delivery message template.
    pub delivery: DeliverySettings,
}

impl LifecycleConfig {
    /// Build from loaded settings.
    pub fn from_settings(settings: &PairlinkSettings) -> Self {
        let s = &settings.session;
        Self {
            pairing_deadline: s.pairing_deadline(),
            settle_delay: s.settle_delay(),
            completion_grace: s.completion_grace(),
            request_timeout: s.request_timeout(),
            close_timeout: s.close_timeout(),
            identity_rules: s.identity_rules(),
            delivery: settings.delivery.clone(),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self::from_settings(&PairlinkSettings::default())
    }
}

/// Why a session is being torn down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CleanupReason {
    /// Grace period after delivery elapsed.
    Completed,
    /// Pairing deadline elapsed.
    TimedOut,
    /// Link dropped.
    Disconnected,
    /// Creation or pairing-code request failed.
    Failed,
    /// A caller asked for it.
    Requested,
    /// The expiry sweep found it idle.
    Expired,
    /// Process shutdown.
    Shutdown,
}

impl fmt::Display for CleanupReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Requested => "requested",
            Self::Expired => "expired",
            Self::Shutdown => "shutdown",
        })
    }
}

/// Shared session state.
pub struct SessionContext {
    /// Session registry.
    pub registry: SessionRegistry,
    /// Connector factory.
    pub factory: ClientFactory,
    /// Credential directories.
    pub store: CredentialStore,
    /// Driver configuration.
    pub config: LifecycleConfig,
    /// Process-wide shutdown signal.
    pub shutdown: CancellationToken,
}

impl SessionContext {
    /// Tear down `identity` if a session exists.
    ///
    /// With `expected`, only that generation is torn down. Returns whether
    /// this call did the teardown; redundant calls return `false`.
    pub async fn cleanup(
        &self,
        identity: &Identity,
        expected: Option<&SessionId>,
        reason: CleanupReason,
    ) -> bool {
        match self.registry.remove(identity, expected) {
            Some(teardown) => {
                self.teardown(teardown, reason).await;
                true
            }
            None => false,
        }
    }

    /// Release everything a removed session held.
    ///
    /// Close and directory failures are logged, never returned: the entry is
    /// released regardless so the identity becomes claimable again.
    pub async fn teardown(&self, teardown: Teardown, reason: CleanupReason) {
        let Teardown {
            record,
            handle,
            cancel,
        } = teardown;
        let identity = &record.identity;
        let session_id = record.session_id.as_str();
        cancel.cancel();

        if let Some(handle) = handle {
            if tokio::time::timeout(self.config.close_timeout, handle.close())
                .await
                .is_err()
            {
                warn!(
                    identity = %identity,
                    session_id,
                    timeout_ms = self.config.close_timeout.as_millis(),
                    "connector close timed out"
                );
            }
        }
        if let Err(e) = self.store.discard(identity).await {
            warn!(identity = %identity, session_id, error = %e, "failed to remove credential directory");
        }

        let _ = self.registry.release(identity, &record.session_id);
        info!(
            identity = %identity,
            session_id,
            reason = %reason,
            last_status = %record.status,
            "session cleaned up"
        );
    }
}
