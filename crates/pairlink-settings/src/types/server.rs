//! Server, storage, connector, and logging settings.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use pairlink_core::logging::LogFormat;
use serde::{Deserialize, Serialize};

/// HTTP listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
        }
    }
}

/// Where per-identity credential directories live.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    /// Root directory. Relative paths resolve under the pairlink home
    /// directory; a leading `~/` expands to `$HOME`.
    pub root: String,
}

impl StorageSettings {
    /// Resolve [`Self::root`] against `home` (the pairlink home directory).
    pub fn resolve_root(&self, home: &Path) -> PathBuf {
        if let Some(rest) = self.root.strip_prefix("~/") {
            return user_home().join(rest);
        }
        let root = Path::new(&self.root);
        if root.is_absolute() {
            root.to_path_buf()
        } else {
            home.join(root)
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            root: "tokens".to_string(),
        }
    }
}

/// Process-backed connector settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectorSettings {
    /// Program launched once per session.
    pub command: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Extra environment for the program.
    pub env: BTreeMap<String, String>,
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self {
            command: "pairlink-connector".to_string(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }
}

/// Logging output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level (an `EnvFilter` directive).
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

/// `$HOME`, or `/tmp` when unset.
pub fn user_home() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}
