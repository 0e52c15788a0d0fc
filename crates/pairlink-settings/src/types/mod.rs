//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and implement
//! [`Default`] with production values. Types marked `#[serde(default)]` accept
//! partial JSON; missing fields keep their default.

mod server;
mod session;

pub use server::*;
pub use session::*;

pub use pairlink_core::RetryConfig;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type for the pairlink broker.
///
/// Loaded from `~/.pairlink/settings.json` with defaults for missing fields.
/// Example:
///
/// ```json
/// {
///   "server": { "port": 4000 },
///   "retry": { "maxAttempts": 5, "strategy": "exponential" }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PairlinkSettings {
    /// HTTP listener.
    pub server: ServerSettings,
    /// Per-session timing and limits.
    pub session: SessionSettings,
    /// Connector-creation retries.
    pub retry: RetryConfig,
    /// Expiry sweep.
    pub reaper: ReaperSettings,
    /// Shutdown drain.
    pub shutdown: ShutdownSettings,
    /// Credential directories.
    pub storage: StorageSettings,
    /// Process-backed connector.
    pub connector: ConnectorSettings,
    /// Logging output.
    pub logging: LoggingSettings,
    /// Credential delivery message.
    pub delivery: DeliverySettings,
}

impl PairlinkSettings {
    /// Reject combinations that would make the lifecycle misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(SettingsError::InvalidValue(
                "retry.maxAttempts must be at least 1".into(),
            ));
        }
        if self.retry.attempt_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "retry.attemptTimeoutMs must be positive".into(),
            ));
        }
        if self.retry.backoff.max_delay_ms < self.retry.backoff.base_delay_ms {
            return Err(SettingsError::InvalidValue(
                "retry.maxDelayMs must not be below retry.baseDelayMs".into(),
            ));
        }
        let s = &self.session;
        if s.min_identity_digits == 0 || s.min_identity_digits > s.max_identity_digits {
            return Err(SettingsError::InvalidValue(format!(
                "session identity digit bounds are inconsistent ({}..={})",
                s.min_identity_digits, s.max_identity_digits
            )));
        }
        if s.max_concurrent_sessions == 0 {
            return Err(SettingsError::InvalidValue(
                "session.maxConcurrentSessions must be at least 1".into(),
            ));
        }
        if self.reaper.interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "reaper.intervalMs must be positive".into(),
            ));
        }
        if !self.delivery.template.contains(PAYLOAD_PLACEHOLDER) {
            return Err(SettingsError::InvalidValue(format!(
                "delivery.template must contain {PAYLOAD_PLACEHOLDER}"
            )));
        }
        Ok(())
    }
}
