//! Session lifecycle timing, expiry sweep, shutdown, and delivery settings.

use std::time::Duration;

use pairlink_core::IdentityRules;
use serde::{Deserialize, Serialize};

/// Placeholder replaced by the base64 credential snapshot in
/// [`DeliverySettings::template`].
pub const PAYLOAD_PLACEHOLDER: &str = "{payload}";

/// Per-session timing and limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Time from code issuance until the link must be up.
    pub pairing_deadline_ms: u64,
    /// Wait after the link comes up before delivering credentials.
    pub settle_delay_ms: u64,
    /// Wait after delivery before tearing the session down.
    pub completion_grace_ms: u64,
    /// Bound on pairing-code requests and payload delivery.
    pub request_timeout_ms: u64,
    /// Bound on closing a connector handle.
    pub close_timeout_ms: u64,
    /// Maximum sessions held by the registry at once.
    pub max_concurrent_sessions: usize,
    /// Minimum digits in a normalized identity.
    pub min_identity_digits: usize,
    /// Maximum digits in a normalized identity.
    pub max_identity_digits: usize,
}

impl SessionSettings {
    /// Pairing deadline as a [`Duration`].
    pub fn pairing_deadline(&self) -> Duration {
        Duration::from_millis(self.pairing_deadline_ms)
    }

    /// Settle delay as a [`Duration`].
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Completion grace as a [`Duration`].
    pub fn completion_grace(&self) -> Duration {
        Duration::from_millis(self.completion_grace_ms)
    }

    /// Request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Close timeout as a [`Duration`].
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Identity validation bounds.
    pub fn identity_rules(&self) -> IdentityRules {
        IdentityRules {
            min_digits: self.min_identity_digits,
            max_digits: self.max_identity_digits,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            pairing_deadline_ms: 45_000,
            settle_delay_ms: 3_000,
            completion_grace_ms: 5_000,
            request_timeout_ms: 30_000,
            close_timeout_ms: 10_000,
            max_concurrent_sessions: 256,
            min_identity_digits: 7,
            max_identity_digits: 15,
        }
    }
}

/// Expiry sweep settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReaperSettings {
    /// Time between sweeps.
    pub interval_ms: u64,
    /// Idle age after which an unprotected session is evicted.
    pub max_age_ms: u64,
}

impl ReaperSettings {
    /// Sweep interval as a [`Duration`].
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Maximum idle age as a [`Duration`].
    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.max_age_ms)
    }
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            max_age_ms: 600_000,
        }
    }
}

/// Shutdown drain settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShutdownSettings {
    /// Bound on each session's cleanup during the drain.
    pub per_session_timeout_ms: u64,
}

impl ShutdownSettings {
    /// Per-session bound as a [`Duration`].
    pub fn per_session_timeout(&self) -> Duration {
        Duration::from_millis(self.per_session_timeout_ms)
    }
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            per_session_timeout_ms: 5_000,
        }
    }
}

/// Credential delivery settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeliverySettings {
    /// Message text sent to the linked device; must contain `{payload}`.
    pub template: String,
}

impl DeliverySettings {
    /// Render the message for an encoded payload.
    pub fn render(&self, encoded: &str) -> String {
        self.template.replace(PAYLOAD_PLACEHOLDER, encoded)
    }
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            template: "Your session credentials:\n\n{payload}\n\nKeep this message private."
                .to_string(),
        }
    }
}
