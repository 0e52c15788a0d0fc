//! Session status and the lifecycle transition table.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Status of a device-linking session.
///
/// Happy path:
/// `Initializing → Requesting → CodeGenerated → Connecting → Connected → Completed → CleanedUp`.
///
/// Any state before `Completed` may short-circuit to `TimedOut` or
/// `Disconnected`. Cleanup can run from any state, since a caller, the reaper,
/// or shutdown may tear a session down wherever it happens to be.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    /// Registry slot claimed, nothing started yet.
    Initializing,
    /// Connector being created and pairing code requested.
    Requesting,
    /// Pairing code issued; waiting for the remote device.
    CodeGenerated,
    /// Remote device confirmed; link is coming up.
    Connecting,
    /// Link is up; credential delivery pending.
    Connected,
    /// Delivery attempted; waiting out the grace period.
    Completed,
    /// Pairing deadline elapsed before the link came up.
    TimedOut,
    /// Link dropped before completion.
    Disconnected,
    /// Cleanup ran; the session no longer exists.
    CleanedUp,
}

impl SessionStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [Self; 9] = [
        Self::Initializing,
        Self::Requesting,
        Self::CodeGenerated,
        Self::Connecting,
        Self::Connected,
        Self::Completed,
        Self::TimedOut,
        Self::Disconnected,
        Self::CleanedUp,
    ];

    /// Whether `self → next` is permitted.
    pub fn can_transition_to(self, next: Self) -> bool {
        use SessionStatus::{
            CleanedUp, CodeGenerated, Completed, Connected, Connecting, Disconnected,
            Initializing, Requesting, TimedOut,
        };
        match (self, next) {
            (CleanedUp, _) => false,
            (_, CleanedUp) => true,
            (Initializing, Requesting)
            | (Requesting, CodeGenerated)
            | (CodeGenerated, Connecting)
            | (Connecting, Connected)
            | (Connected, Completed) => true,
            (s, TimedOut | Disconnected) => s.is_in_flight(),
            _ => false,
        }
    }

    /// Whether the session is still working toward `Completed`.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            Self::Initializing
                | Self::Requesting
                | Self::CodeGenerated
                | Self::Connecting
                | Self::Connected
        )
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        self == Self::CleanedUp
    }

    /// Whether the expiry sweep must leave the session alone.
    pub fn is_reap_protected(self) -> bool {
        matches!(self, Self::Connected | Self::Completed)
    }

    /// Wire name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Requesting => "requesting",
            Self::CodeGenerated => "codeGenerated",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Completed => "completed",
            Self::TimedOut => "timedOut",
            Self::Disconnected => "disconnected",
            Self::CleanedUp => "cleanedUp",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
