//! # pairlink-server
//!
//! Thin axum transport over [`pairlink_runtime::PairingService`].
//!
//! - `POST /api/request-pair-code`: start a session, return its pairing code
//! - `GET /api/session-status/{phone}`: status of a live session
//! - `DELETE /api/cleanup-session/{phone}`: tear a session down
//! - `GET /api/health`: liveness and session count
//!
//! The listener stops accepting once the shared shutdown token fires.

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod health;
pub mod routes;
pub mod server;

pub use config::ServerConfig;
pub use error::ApiError;
pub use server::{AppState, PairlinkServer};
