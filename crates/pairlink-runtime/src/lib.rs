//! # pairlink-runtime
//!
//! The session lifecycle manager: everything between "a caller supplied a
//! phone number" and "the linked device has its credentials and the session
//! is gone".
//!
//! - [`SessionRegistry`]: at most one session per identity
//! - [`ClientFactory`]: connector creation with timeouts and backoff
//! - [`lifecycle`]: start-up and the per-session driver
//! - [`ExpiryReaper`]: periodic eviction of stuck sessions
//! - [`ShutdownCoordinator`]: bounded drain on termination
//! - [`PairingService`]: the facade tying them together

#![deny(unsafe_code)]

pub mod connector;
pub mod context;
pub mod credentials;
pub mod factory;
pub mod lifecycle;
pub mod reaper;
pub mod registry;
pub mod service;
pub mod shutdown;
pub mod testing;

pub use connector::{Connector, ConnectorError, ConnectorEvent, ConnectorHandle, ConnectorLink};
pub use context::{CleanupReason, LifecycleConfig, SessionContext};
pub use credentials::CredentialStore;
pub use factory::{ClientFactory, CreatedConnection};
pub use lifecycle::SessionStarted;
pub use reaper::ExpiryReaper;
pub use registry::{SessionRecord, SessionRegistry};
pub use service::{PairingService, ServiceConfig, StatusView};
pub use shutdown::{DrainReport, ShutdownCoordinator};
