//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`PairlinkSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `PAIRLINK_*` environment overrides (highest priority)
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use pairlink_core::logging::LogFormat;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::{PairlinkSettings, user_home};

/// Pairing deadline applied in cloud mode.
pub const CLOUD_PAIRING_DEADLINE_MS: u64 = 30_000;
/// Per-attempt creation bound applied in cloud mode.
pub const CLOUD_ATTEMPT_TIMEOUT_MS: u64 = 20_000;

/// The pairlink home directory (`~/.pairlink`).
pub fn pairlink_home() -> PathBuf {
    user_home().join(".pairlink")
}

/// Path to the default settings file (`~/.pairlink/settings.json`).
pub fn settings_path() -> PathBuf {
    pairlink_home().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<PairlinkSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from `path` with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or an invalid final value
/// is an error.
pub fn load_settings_from_path(path: &Path) -> Result<PairlinkSettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Defaults merged with the file at `path`, without env overrides.
pub fn load_file_layer(path: &Path) -> Result<PairlinkSettings> {
    let defaults = serde_json::to_value(PairlinkSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `PAIRLINK_*` overrides from the process environment.
pub fn apply_env_overrides(settings: &mut PairlinkSettings) {
    apply_overrides_from(settings, |key| std::env::var(key).ok());
}

/// Apply `PAIRLINK_*` overrides read through `lookup`.
///
/// Invalid values are logged and ignored. Cloud mode runs first so that
/// explicit timing overrides still win over it.
pub fn apply_overrides_from<F>(settings: &mut PairlinkSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    // ── Cloud mode ──────────────────────────────────────────────────
    if env.bool("PAIRLINK_CLOUD") == Some(true) {
        let session = &mut settings.session;
        session.pairing_deadline_ms = session.pairing_deadline_ms.min(CLOUD_PAIRING_DEADLINE_MS);
        let retry = &mut settings.retry;
        retry.attempt_timeout_ms = retry.attempt_timeout_ms.min(CLOUD_ATTEMPT_TIMEOUT_MS);
    }

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("PAIRLINK_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u16("PAIRLINK_PORT", 1, 65535) {
        settings.server.port = v;
    }

    // ── Storage / connector ─────────────────────────────────────────
    if let Some(v) = env.string("PAIRLINK_STORAGE_ROOT") {
        settings.storage.root = v;
    }
    if let Some(v) = env.string("PAIRLINK_CONNECTOR_COMMAND") {
        settings.connector.command = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("PAIRLINK_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.string("PAIRLINK_LOG_FORMAT") {
        match LogFormat::parse(&v) {
            Some(format) => settings.logging.format = format,
            None => warn!(key = "PAIRLINK_LOG_FORMAT", value = %v, "invalid log format, ignoring"),
        }
    }

    // ── Session / retry ─────────────────────────────────────────────
    if let Some(v) = env.usize("PAIRLINK_MAX_SESSIONS", 1, 100_000) {
        settings.session.max_concurrent_sessions = v;
    }
    if let Some(v) = env.u64("PAIRLINK_PAIRING_DEADLINE_MS", 1_000, 3_600_000) {
        settings.session.pairing_deadline_ms = v;
    }
    if let Some(v) = env.u64("PAIRLINK_MAX_ATTEMPTS", 1, 20) {
        // bounded to 20 above, so the narrowing cannot truncate
        settings.retry.max_attempts = u32::try_from(v).unwrap_or(1);
    }
    if let Some(v) = env.u64("PAIRLINK_ATTEMPT_TIMEOUT_MS", 100, 600_000) {
        settings.retry.attempt_timeout_ms = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

// ── Env readers ─────────────────────────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, kind: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        let val = (self.lookup)(name)?;
        let result = parse(&val);
        if result.is_none() {
            warn!(key = name, value = %val, kind, "invalid env var, ignoring");
        }
        result
    }

    fn bool(&self, name: &str) -> Option<bool> {
        self.parsed(name, "bool", parse_bool)
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        self.parsed(name, "u16", |v| parse_u16_range(v, min, max))
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.parsed(name, "u64", |v| parse_u64_range(v, min, max))
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        self.parsed(name, "usize", |v| parse_usize_range(v, min, max))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
