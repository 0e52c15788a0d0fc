//! Listener configuration.

use pairlink_settings::PairlinkSettings;

/// Where the HTTP listener binds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// Host to bind (default `"0.0.0.0"`).
    pub host: String,
    /// Port to bind (default `3001`, `0` for auto-assign).
    pub port: u16,
}

impl ServerConfig {
    /// Take host and port from loaded settings.
    pub fn from_settings(settings: &PairlinkSettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
        }
    }

    /// `host:port` as passed to the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_settings(&PairlinkSettings::default())
    }
}
