//! Configuration structs with sensible defaults and RON persistence.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// File name used inside the config directory.
const CONFIG_FILE: &str = "config.ron";

/// Top-level client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Endpoint and session settings.
    pub connection: ConnectionConfig,
    /// Reconnect backoff.
    pub reconnect: ReconnectConfig,
    /// Heartbeat thresholds.
    pub keepalive: HeartbeatConfig,
    /// Request defaults.
    pub requests: RequestConfig,
    /// Socket and framing options.
    pub transport: TransportConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Endpoint and session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Remote endpoint, `tcp://host:port` or `host:port`.
    pub url: String,
    /// Connect as soon as the client starts.
    pub auto_connect: bool,
    /// Reconnect automatically after a lost connection.
    pub auto_reconnect: bool,
    /// Event name of the authentication envelope.
    pub auth_event: String,
    /// Credential sent after every open. `None` skips the handshake.
    pub auth_token: Option<String>,
}

/// Reconnect backoff configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay sequence in milliseconds. The last value repeats.
    pub delays_ms: Vec<u64>,
    /// Consecutive failures tolerated before giving up.
    pub max_attempts: u32,
    /// Jitter factor (0.0 - 1.0) applied to each delay.
    pub jitter: f64,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// How often inbound silence is checked.
    pub poll_interval_ms: u64,
    /// Silence after which a probe is sent.
    pub warn_after_ms: u64,
    /// Silence after which the connection is dropped.
    pub abort_after_ms: u64,
}

/// Request configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RequestConfig {
    /// Timeout applied to sends that don't specify one. `None` waits forever.
    pub default_timeout_ms: Option<u64>,
    /// Tell the remote when a transmitted request is cancelled.
    pub notify_remote_cancel: bool,
    /// Notifications buffered per lagging subscriber.
    pub notification_capacity: usize,
}

/// Socket and framing configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    /// Largest frame accepted or sent, in bytes.
    pub max_frame_size: u32,
    /// Give up on a connect after this many milliseconds.
    pub connect_timeout_ms: u64,
    /// Disable Nagle's algorithm.
    pub tcp_nodelay: bool,
    /// OS keepalive idle time in seconds. `None` disables it.
    pub tcp_keepalive_secs: Option<u64>,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Print every notification the client receives.
    pub print_notifications: bool,
}

// --- Default implementations ---

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "tcp://127.0.0.1:7400".to_string(),
            auto_connect: true,
            auto_reconnect: true,
            auth_event: "auth".to_string(),
            auth_token: None,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            delays_ms: vec![1_000, 2_000, 5_000, 10_000],
            max_attempts: 5,
            jitter: 0.0,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            warn_after_ms: 15_000,
            abort_after_ms: 20_000,
        }
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: None,
            notify_remote_cancel: true,
            notification_capacity: 256,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 1_048_576,
            connect_timeout_ms: 10_000,
            tcp_nodelay: true,
            tcp_keepalive_secs: Some(60),
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            print_notifications: true,
        }
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join(CONFIG_FILE);
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection.url.trim().is_empty() {
            return Err(ConfigError::Invalid("connection.url is empty".into()));
        }
        if self.reconnect.delays_ms.is_empty() {
            return Err(ConfigError::Invalid("reconnect.delays_ms is empty".into()));
        }
        if !(0.0..=1.0).contains(&self.reconnect.jitter) {
            return Err(ConfigError::Invalid(format!(
                "reconnect.jitter {} not in 0.0..=1.0",
                self.reconnect.jitter
            )));
        }
        let hb = &self.keepalive;
        if hb.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("keepalive.poll_interval_ms is 0".into()));
        }
        if hb.warn_after_ms >= hb.abort_after_ms {
            return Err(ConfigError::Invalid(format!(
                "keepalive.warn_after_ms ({}) must be below abort_after_ms ({})",
                hb.warn_after_ms, hb.abort_after_ms
            )));
        }
        if self.transport.max_frame_size == 0 {
            return Err(ConfigError::Invalid("transport.max_frame_size is 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_serializes() {
        let config = Config::default();
        let ron_str =
            ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::new().depth_limit(3))
                .unwrap();
        assert!(ron_str.contains("url: \"tcp://127.0.0.1:7400\""));
        assert!(ron_str.contains("max_attempts: 5"));
    }

    #[test]
    fn test_config_roundtrip() {
        let mut config = Config::default();
        config.connection.auth_token = Some("secret".to_string());
        config.requests.default_timeout_ms = Some(5_000);
        let ron_str = ron::to_string(&config).unwrap();
        let deserialized: Config = ron::from_str(&ron_str).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_missing_section_uses_default() {
        let ron_str = "(connection: (url: \"tcp://10.0.0.2:9000\"))";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.connection.url, "tcp://10.0.0.2:9000");
        assert!(config.connection.auto_reconnect);
        assert_eq!(config.keepalive, HeartbeatConfig::default());
    }

    #[test]
    fn test_extra_field_ignored() {
        let result: Result<Config, _> = ron::from_str("(future_setting: true)");
        assert!(result.is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.connection.url = "tcp://10.0.0.1:7400".to_string();
        config.reconnect.delays_ms = vec![500, 1_000];

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_or_create_writes_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, Config::default());
        assert!(dir.path().join("config.ron").exists());
    }

    #[test]
    fn test_invalid_ron_produces_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.ron"), "{{not valid}}").unwrap();
        assert!(matches!(
            Config::load_or_create(dir.path()),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_heartbeat() {
        let mut config = Config::default();
        config.keepalive.warn_after_ms = 30_000;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_empty_backoff() {
        let mut config = Config::default();
        config.reconnect.delays_ms.clear();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
