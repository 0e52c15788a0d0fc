//! Broker error taxonomy.
//!
//! [`LinkError`] is what the session lifecycle reports to callers. Only
//! validation, conflict, capacity, creation, and pairing failures ever reach a
//! caller; delivery and cleanup failures are logged by the session driver and
//! swallowed.

/// Errors surfaced by the session lifecycle.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    /// The supplied identity is malformed or missing.
    #[error("{0}")]
    Validation(String),

    /// A session for this identity is already active.
    #[error("Session already active for this number: {0}")]
    Conflict(String),

    /// The registry is at its configured session limit.
    #[error("Session limit reached ({limit} active)")]
    Capacity {
        /// Configured maximum.
        limit: usize,
    },

    /// The connector could not be created within the retry budget.
    #[error("Connection creation failed after {attempts} attempt(s): {last_error}")]
    ConnectionCreation {
        /// Attempts consumed.
        attempts: u32,
        /// Message of the last underlying failure.
        last_error: String,
    },

    /// The connector failed to produce a pairing code.
    #[error("Pairing code request failed: {0}")]
    PairingRequest(String),

    /// Credential payload could not be delivered.
    #[error("Delivery failed: {0}")]
    Delivery(String),

    /// Releasing the connector or its artifacts failed.
    #[error("Cleanup failed: {0}")]
    Cleanup(String),

    /// No session exists for the identity.
    #[error("Session not found: {0}")]
    NotFound(String),

    /// The operation was abandoned because the session or process is shutting down.
    #[error("Operation cancelled")]
    Cancelled,
}

impl LinkError {
    /// Error category string for logs and API payloads.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Conflict(_) => "conflict",
            Self::Capacity { .. } => "capacity",
            Self::ConnectionCreation { .. } => "connection_creation",
            Self::PairingRequest(_) => "pairing_request",
            Self::Delivery(_) => "delivery",
            Self::Cleanup(_) => "cleanup",
            Self::NotFound(_) => "not_found",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the caller may reasonably retry the same request later.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Conflict(_)
            | Self::Capacity { .. }
            | Self::ConnectionCreation { .. }
            | Self::PairingRequest(_)
            | Self::Cancelled => true,
            Self::Validation(_)
            | Self::Delivery(_)
            | Self::Cleanup(_)
            | Self::NotFound(_) => false,
        }
    }
}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, LinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_display() {
        let err = LinkError::Conflict("15551234567".into());
        assert_eq!(
            err.to_string(),
            "Session already active for this number: 15551234567"
        );
    }

    #[test]
    fn validation_display_is_bare_message() {
        let err = LinkError::Validation("Phone number is required".into());
        assert_eq!(err.to_string(), "Phone number is required");
    }

    #[test]
    fn creation_display_carries_attempts_and_cause() {
        let err = LinkError::ConnectionCreation {
            attempts: 3,
            last_error: "attempt timed out".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("3 attempt"));
        assert!(msg.contains("attempt timed out"));
    }

    #[test]
    fn categories_are_distinct() {
        let errors = [
            LinkError::Validation(String::new()),
            LinkError::Conflict(String::new()),
            LinkError::Capacity { limit: 1 },
            LinkError::ConnectionCreation {
                attempts: 1,
                last_error: String::new(),
            },
            LinkError::PairingRequest(String::new()),
            LinkError::Delivery(String::new()),
            LinkError::Cleanup(String::new()),
            LinkError::NotFound(String::new()),
            LinkError::Cancelled,
        ];
        let mut categories: Vec<_> = errors.iter().map(LinkError::category).collect();
        categories.sort_unstable();
        categories.dedup();
        assert_eq!(categories.len(), errors.len());
    }

    #[test]
    fn recoverability() {
        assert!(LinkError::Conflict(String::new()).is_recoverable());
        assert!(LinkError::Capacity { limit: 2 }.is_recoverable());
        assert!(!LinkError::Validation(String::new()).is_recoverable());
        assert!(!LinkError::NotFound(String::new()).is_recoverable());
    }
}
