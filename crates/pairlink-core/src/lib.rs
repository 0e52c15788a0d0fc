//! # pairlink-core
//!
//! Foundation types, errors, identities, and backoff math for the pairlink
//! device-linking broker.
//!
//! This crate holds the vocabulary every other pairlink crate shares:
//!
//! - **Identities**: [`Identity`], the normalized digits-only key of a session
//! - **IDs**: [`SessionId`], a time-ordered id used to correlate logs
//! - **Status**: [`SessionStatus`] and its transition table
//! - **Errors**: [`LinkError`], the broker's error taxonomy
//! - **Retry**: [`RetryConfig`] and [`BackoffPolicy`] for connector creation
//! - **Logging**: [`logging::init_subscriber`] and test capture helpers

#![deny(unsafe_code)]

pub mod errors;
pub mod identity;
pub mod ids;
pub mod logging;
pub mod retry;
pub mod status;

pub use errors::{LinkError, Result};
pub use identity::{Identity, IdentityRules};
pub use ids::SessionId;
pub use retry::{BackoffPolicy, BackoffStrategy, RetryConfig};
pub use status::SessionStatus;
