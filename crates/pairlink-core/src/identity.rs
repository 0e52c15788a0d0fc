//! Session identities.
//!
//! Callers supply a phone number in whatever shape they typed it
//! (`+1 (555) 123-4567`, `15551234567`, ...). The broker keys everything on
//! the digits alone, so two spellings of the same number contend for the same
//! registry slot.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::LinkError;

/// Bounds applied when validating a normalized identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdentityRules {
    /// Minimum number of digits after normalization.
    pub min_digits: usize,
    /// Maximum number of digits after normalization (E.164 allows 15).
    pub max_digits: usize,
}

impl Default for IdentityRules {
    fn default() -> Self {
        Self {
            min_digits: 7,
            max_digits: 15,
        }
    }
}

/// Normalized, digits-only identity key.
///
/// Deserialization goes through [`Identity::parse`], so a decoded value is
/// normalized and validated like any other.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Identity(String);

impl Identity {
    /// Normalize and validate `raw` with the default rules.
    pub fn parse(raw: &str) -> Result<Self, LinkError> {
        Self::parse_with(raw, IdentityRules::default())
    }

    /// Normalize and validate `raw` with explicit rules.
    pub fn parse_with(raw: &str, rules: IdentityRules) -> Result<Self, LinkError> {
        let digits = normalize(raw);
        if digits.is_empty() {
            return Err(LinkError::Validation("Phone number is required".into()));
        }
        if digits.len() < rules.min_digits || digits.len() > rules.max_digits {
            return Err(LinkError::Validation(format!(
                "Phone number must have between {} and {} digits, got {}",
                rules.min_digits,
                rules.max_digits,
                digits.len()
            )));
        }
        Ok(Self(digits))
    }

    /// The digits-only key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Identity {
    type Error = LinkError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<Identity> for String {
    fn from(identity: Identity) -> Self {
        identity.0
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Strip everything but ASCII digits.
pub fn normalize(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_digit).collect()
}
