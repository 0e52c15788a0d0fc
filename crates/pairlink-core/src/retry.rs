//! Retry configuration and backoff calculation.
//!
//! This module holds the portable, sync-only half of connector-creation
//! retries. The async loop that sleeps between attempts lives in
//! `pairlink-runtime`:
//!
//! - [`RetryConfig`]: attempt budget, per-attempt timeout, and backoff policy
//! - [`BackoffPolicy`]: maps a retry index to a delay
//! - [`calculate_backoff_delay`]: the underlying math

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Default attempt budget for connector creation.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default base delay in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 2_000;
/// Default delay ceiling in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 10_000;
/// Default bound on a single creation attempt in milliseconds.
pub const DEFAULT_ATTEMPT_TIMEOUT_MS: u64 = 30_000;

/// How the delay grows with the retry index.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// `base * n`, capped.
    #[default]
    Linear,
    /// `base * 2^(n-1)`, capped.
    Exponential,
}

/// Backoff policy: retry index to delay.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffPolicy {
    /// Growth strategy.
    #[serde(default)]
    pub strategy: BackoffStrategy,
    /// Delay before the first retry in ms.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Ceiling on any single delay in ms.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl BackoffPolicy {
    /// Delay to wait after the `retry`-th failed attempt (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        Duration::from_millis(calculate_backoff_delay(
            self.strategy,
            retry,
            self.base_delay_ms,
            self.max_delay_ms,
        ))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Linear,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

/// Configuration for connector-creation retries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Total attempts, including the first (default: 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Bound on one attempt in ms (default: 30000).
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    /// Delay policy between attempts.
    #[serde(flatten)]
    pub backoff: BackoffPolicy,
}

impl RetryConfig {
    /// Per-attempt bound as a [`Duration`].
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}
fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}
fn default_attempt_timeout_ms() -> u64 {
    DEFAULT_ATTEMPT_TIMEOUT_MS
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            attempt_timeout_ms: DEFAULT_ATTEMPT_TIMEOUT_MS,
            backoff: BackoffPolicy::default(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Backoff calculation
// ─────────────────────────────────────────────────────────────────────────────

/// Calculate the delay before the next attempt.
///
/// `retry` is 1-based: `1` is the wait after the first failed attempt. A
/// `retry` of `0` yields no delay. Below the ceiling, successive delays are
/// strictly increasing for any non-zero base.
pub fn calculate_backoff_delay(
    strategy: BackoffStrategy,
    retry: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
) -> u64 {
    if retry == 0 {
        return 0;
    }
    let raw = match strategy {
        BackoffStrategy::Linear => base_delay_ms.saturating_mul(u64::from(retry)),
        BackoffStrategy::Exponential => {
            base_delay_ms.saturating_mul(1u64 << (retry - 1).min(31))
        }
    };
    raw.min(max_delay_ms)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
