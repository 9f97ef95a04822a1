//! Configuration for Homeport
//!
//! Values come from an optional `homeport.yml`, then CLI flags and
//! environment variables override them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use homeport_shared::protocol::MAX_MESSAGE_SIZE;
use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;
use crate::ha_config::DEFAULT_TRUSTED_PROXIES;
use crate::relay::RelaySettings;
use crate::tunnel::TunnelSettings;
use crate::validator::DEFAULT_CHECK_URL;

/// Log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    #[serde(alias = "warning")]
    #[value(alias = "warning")]
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Contents of `homeport.yml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Relay auth token
    pub token: Option<String>,

    /// Relay WebSocket URL
    pub relay_url: Option<String>,

    /// Local backend base URL
    pub backend_url: Option<String>,

    pub log_level: Option<LogLevel>,

    #[serde(default)]
    pub tunnel: TunnelOptions,

    #[serde(default)]
    pub patch: PatchOptions,
}

/// Connection tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelOptions {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,

    #[serde(default = "default_ten_secs")]
    pub auth_timeout_secs: u64,

    #[serde(default = "default_ten_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_backoff_floor")]
    pub backoff_floor_ms: u64,

    #[serde(default = "default_backoff_ceiling")]
    pub backoff_ceiling_ms: u64,

    /// Extra random delay, as a fraction of the backoff interval
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: f64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_ten_secs")]
    pub ws_close_grace_secs: u64,

    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            auth_timeout_secs: default_ten_secs(),
            connect_timeout_secs: default_ten_secs(),
            backoff_floor_ms: default_backoff_floor(),
            backoff_ceiling_ms: default_backoff_ceiling(),
            backoff_jitter: default_backoff_jitter(),
            request_timeout_secs: default_request_timeout(),
            ws_close_grace_secs: default_ten_secs(),
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

impl TunnelOptions {
    pub fn tunnel_settings(&self) -> TunnelSettings {
        TunnelSettings {
            auth_timeout: Duration::from_secs(self.auth_timeout_secs),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs),
        }
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            floor: Duration::from_millis(self.backoff_floor_ms),
            ceiling: Duration::from_millis(self.backoff_ceiling_ms),
            jitter: self.backoff_jitter,
            ..BackoffPolicy::default()
        }
    }

    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            close_grace: Duration::from_secs(self.ws_close_grace_secs),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Backend configuration patch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchOptions {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Backend `configuration.yaml`
    #[serde(default = "default_config_path")]
    pub config_path: PathBuf,

    /// Ranges the backend must trust
    #[serde(default = "default_trusted_proxies")]
    pub trusted_proxies: Vec<String>,

    /// check_config endpoint
    #[serde(default = "default_validation_url")]
    pub validation_url: String,

    #[serde(default = "default_validation_timeout")]
    pub validation_timeout_secs: u64,

    /// Write a timestamped copy before patching
    #[serde(default = "default_true")]
    pub keep_backup: bool,

    /// Token for the validation endpoint
    #[serde(default, skip_serializing)]
    pub supervisor_token: Option<String>,
}

impl Default for PatchOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            config_path: default_config_path(),
            trusted_proxies: default_trusted_proxies(),
            validation_url: default_validation_url(),
            validation_timeout_secs: default_validation_timeout(),
            keep_backup: true,
            supervisor_token: None,
        }
    }
}

impl PatchOptions {
    pub fn validation_timeout(&self) -> Duration {
        Duration::from_secs(self.validation_timeout_secs)
    }
}

fn default_heartbeat_interval() -> u64 {
    20
}

fn default_heartbeat_timeout() -> u64 {
    30
}

fn default_ten_secs() -> u64 {
    10
}

fn default_backoff_floor() -> u64 {
    1_000
}

fn default_backoff_ceiling() -> u64 {
    60_000
}

fn default_backoff_jitter() -> f64 {
    0.2
}

fn default_request_timeout() -> u64 {
    60
}

fn default_max_message_bytes() -> usize {
    MAX_MESSAGE_SIZE
}

fn default_true() -> bool {
    true
}

fn default_config_path() -> PathBuf {
    PathBuf::from("/config/configuration.yaml")
}

fn default_trusted_proxies() -> Vec<String> {
    DEFAULT_TRUSTED_PROXIES.iter().map(|s| s.to_string()).collect()
}

fn default_validation_url() -> String {
    DEFAULT_CHECK_URL.to_string()
}

fn default_validation_timeout() -> u64 {
    30
}

impl ConfigFile {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        serde_yaml::from_str(&content).with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Search for config file in standard locations
    pub fn find_config() -> Option<PathBuf> {
        let candidates = ["homeport.yml", "homeport.yaml", ".homeport.yml", ".homeport.yaml"];

        for name in &candidates {
            let path = PathBuf::from(name);
            if path.exists() {
                return Some(path);
            }
        }

        if let Some(home) = dirs::home_dir() {
            for name in &candidates {
                let path = home.join(name);
                if path.exists() {
                    return Some(path);
                }
            }
        }

        None
    }
}

/// Values given on the command line or through the environment
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub token: Option<String>,
    pub relay_url: Option<String>,
    pub backend_url: Option<String>,
    pub log_level: Option<LogLevel>,
    pub backend_config: Option<PathBuf>,
    pub skip_patch: bool,
    pub supervisor_token: Option<String>,
}

/// Fully resolved client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub token: String,
    pub relay_url: String,
    pub backend_url: String,
    pub log_level: LogLevel,
    pub tunnel: TunnelOptions,
    pub patch: PatchOptions,
}

impl ClientConfig {
    /// Merge file values with overrides and validate the result
    pub fn resolve(file: ConfigFile, overrides: Overrides) -> Result<Self> {
        let mut patch = file.patch;
        if let Some(path) = overrides.backend_config {
            patch.config_path = path;
        }
        if overrides.skip_patch {
            patch.enabled = false;
        }
        if overrides.supervisor_token.is_some() {
            patch.supervisor_token = overrides.supervisor_token;
        }

        let config = Self {
            token: overrides.token.or(file.token).unwrap_or_default(),
            relay_url: overrides.relay_url.or(file.relay_url).unwrap_or_default(),
            backend_url: overrides.backend_url.or(file.backend_url).unwrap_or_default(),
            log_level: overrides.log_level.or(file.log_level).unwrap_or_default(),
            tunnel: file.tunnel,
            patch,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.token.trim().is_empty() {
            anyhow::bail!("Auth token is required (--token or HOMEPORT_TOKEN)");
        }
        if self.relay_url.is_empty() {
            anyhow::bail!("Relay URL is required (--relay-url or HOMEPORT_RELAY_URL)");
        }
        if !(self.relay_url.starts_with("ws://") || self.relay_url.starts_with("wss://")) {
            anyhow::bail!("Relay URL must start with ws:// or wss://, got '{}'", self.relay_url);
        }
        if self.backend_url.is_empty() {
            anyhow::bail!("Backend URL is required (--backend-url or HOMEPORT_BACKEND_URL)");
        }
        if !(self.backend_url.starts_with("http://") || self.backend_url.starts_with("https://")) {
            anyhow::bail!("Backend URL must start with http:// or https://, got '{}'", self.backend_url);
        }

        let t = &self.tunnel;
        if t.heartbeat_interval_secs == 0 {
            anyhow::bail!("tunnel.heartbeat_interval_secs must be positive");
        }
        if t.heartbeat_timeout_secs < t.heartbeat_interval_secs {
            anyhow::bail!(
                "tunnel.heartbeat_timeout_secs ({}) must be at least heartbeat_interval_secs ({})",
                t.heartbeat_timeout_secs,
                t.heartbeat_interval_secs
            );
        }
        if t.backoff_floor_ms == 0 || t.backoff_floor_ms > t.backoff_ceiling_ms {
            anyhow::bail!("tunnel.backoff_floor_ms must be positive and not above backoff_ceiling_ms");
        }
        if !(0.0..=1.0).contains(&t.backoff_jitter) {
            anyhow::bail!("tunnel.backoff_jitter must be between 0 and 1");
        }
        if self.patch.enabled && self.patch.trusted_proxies.is_empty() {
            anyhow::bail!("patch.trusted_proxies cannot be empty");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn required() -> Overrides {
        Overrides {
            token: Some("tok-123".into()),
            relay_url: Some("wss://relay.example.com/ws/tunnel".into()),
            backend_url: Some("http://localhost:8123".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_config() {
        let yaml = r#"
relay_url: wss://relay.example.com/ws/tunnel
token: "file-token"
backend_url: http://homeassistant:8123
log_level: warning
tunnel:
  heartbeat_interval_secs: 15
  backoff_ceiling_ms: 30000
patch:
  config_path: /tmp/configuration.yaml
  trusted_proxies: ["10.0.0.0/8"]
"#;
        let file: ConfigFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(file.log_level, Some(LogLevel::Warn));
        assert_eq!(file.tunnel.heartbeat_interval_secs, 15);
        assert_eq!(file.tunnel.heartbeat_timeout_secs, 30);
        assert_eq!(file.tunnel.backoff_ceiling_ms, 30_000);
        assert_eq!(file.patch.trusted_proxies, vec!["10.0.0.0/8"]);
        assert!(file.patch.enabled);

        let config = ClientConfig::resolve(file, Overrides::default()).unwrap();
        assert_eq!(config.token, "file-token");
        assert_eq!(config.backend_url, "http://homeassistant:8123");
        assert_eq!(config.tunnel.backoff_policy().ceiling, Duration::from_secs(30));
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::resolve(ConfigFile::default(), required()).unwrap();
        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.patch.config_path, PathBuf::from("/config/configuration.yaml"));
        assert_eq!(config.patch.trusted_proxies.len(), 4);
        assert_eq!(config.tunnel.tunnel_settings().heartbeat_interval, Duration::from_secs(20));
        assert_eq!(config.tunnel.backoff_policy().floor, Duration::from_secs(1));
        assert_eq!(config.tunnel.relay_settings().request_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_overrides_win() {
        let file = ConfigFile {
            token: Some("file-token".into()),
            log_level: Some(LogLevel::Error),
            ..Default::default()
        };
        let overrides = Overrides {
            log_level: Some(LogLevel::Debug),
            backend_config: Some(PathBuf::from("/srv/ha/configuration.yaml")),
            skip_patch: true,
            supervisor_token: Some("sup".into()),
            ..required()
        };
        let config = ClientConfig::resolve(file, overrides).unwrap();
        assert_eq!(config.token, "tok-123");
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.patch.config_path, PathBuf::from("/srv/ha/configuration.yaml"));
        assert!(!config.patch.enabled);
        assert_eq!(config.patch.supervisor_token.as_deref(), Some("sup"));
    }

    #[test]
    fn test_missing_required_values() {
        for overrides in [
            Overrides { token: None, ..required() },
            Overrides { relay_url: None, ..required() },
            Overrides { backend_url: None, ..required() },
        ] {
            assert!(ClientConfig::resolve(ConfigFile::default(), overrides).is_err());
        }
    }

    #[test]
    fn test_rejects_bad_urls() {
        let overrides = Overrides {
            relay_url: Some("https://relay.example.com".into()),
            ..required()
        };
        assert!(ClientConfig::resolve(ConfigFile::default(), overrides).is_err());

        let overrides = Overrides {
            backend_url: Some("localhost:8123".into()),
            ..required()
        };
        assert!(ClientConfig::resolve(ConfigFile::default(), overrides).is_err());
    }

    #[test]
    fn test_rejects_inconsistent_timing() {
        let mut file = ConfigFile::default();
        file.tunnel.heartbeat_timeout_secs = 5;
        assert!(ClientConfig::resolve(file, required()).is_err());

        let mut file = ConfigFile::default();
        file.tunnel.backoff_floor_ms = 120_000;
        assert!(ClientConfig::resolve(file, required()).is_err());
    }
}
