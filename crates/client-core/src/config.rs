//! Client configuration.

use serde::{Deserialize, Serialize};

fn default_sample_freq() -> u32 {
    48_000
}

fn default_gain() -> i32 {
    80
}

fn default_volume() -> i32 {
    100
}

fn default_enabled() -> bool {
    true
}

fn default_latency() -> u32 {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Everything the engine consumes from the host configuration. All fields
/// have defaults so a minimal config carries only the server address and
/// credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Signalling endpoint, `host[:port]`.
    pub server_address: String,
    /// Use TLS for the signalling WebSocket.
    #[serde(default)]
    pub server_secure: bool,
    /// Auto-logon login.
    #[serde(default)]
    pub login: String,
    /// Auto-logon password.
    #[serde(default)]
    pub password: String,
    /// Microphone capture rate, 16000 or 48000.
    #[serde(default = "default_sample_freq")]
    pub microphone_sample_freq: u32,
    /// Microphone gain, 0..100.
    #[serde(default = "default_gain")]
    pub microphone_gain: i32,
    /// Renderer output volume, 0..100.
    #[serde(default = "default_volume")]
    pub renderer_volume: i32,
    /// Renderer output enabled (0 mutes all remote audio).
    #[serde(default = "default_enabled")]
    pub renderer_enabled: bool,
    /// Echo path latency override in milliseconds.
    #[serde(default = "default_latency")]
    pub renderer_latency_ms: u32,
    /// Log severity threshold for the env-filter.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: String::new(),
            server_secure: false,
            login: String::new(),
            password: String::new(),
            microphone_sample_freq: default_sample_freq(),
            microphone_gain: default_gain(),
            renderer_volume: default_volume(),
            renderer_enabled: default_enabled(),
            renderer_latency_ms: default_latency(),
            log_level: default_log_level(),
        }
    }
}

impl ClientConfig {
    pub fn new(server_address: impl Into<String>) -> Self {
        Self { server_address: server_address.into(), ..Self::default() }
    }

    pub fn with_credentials(mut self, login: impl Into<String>, password: impl Into<String>) -> Self {
        self.login = login.into();
        self.password = password.into();
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.server_secure = secure;
        self
    }

    /// Signalling WebSocket URL for the configured endpoint.
    pub fn signaling_url(&self) -> String {
        let scheme = if self.server_secure { "wss" } else { "ws" };
        format!("{scheme}://{}", self.server_address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"server_address":"conf.example.org"}"#).unwrap();
        assert_eq!(config.microphone_sample_freq, 48_000);
        assert_eq!(config.renderer_volume, 100);
        assert!(config.renderer_enabled);
        assert_eq!(config.signaling_url(), "ws://conf.example.org");
    }

    #[test]
    fn secure_endpoint_uses_wss() {
        let config = ClientConfig::new("conf.example.org:8443").with_secure(true);
        assert_eq!(config.signaling_url(), "wss://conf.example.org:8443");
    }
}
