//! Configuration file for Relaytap
//!
//! Holds the tunnel server endpoint, the stored auth token, the default
//! subdomain and inspector settings in a YAML file under the user's
//! config directory.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Values the relay session needs from the outside world
pub trait TunnelSettings {
    fn token(&self) -> Option<String>;
    fn server_endpoint(&self) -> String;
    fn default_subdomain(&self) -> Option<String>;
    fn inspector_port(&self) -> u16;
}

/// Root configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Tunnel server WebSocket endpoint
    #[serde(default = "default_server")]
    pub server: String,

    /// Opaque bearer token passed to the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Subdomain requested when none is given on the command line
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,

    /// Inspector settings
    #[serde(default)]
    pub inspector: InspectorConfig,

    /// Local hostname to forward to
    #[serde(default = "default_host")]
    pub local_host: String,

    /// Upper bound on a single local request
    #[serde(default = "default_forward_timeout")]
    pub forward_timeout_secs: u64,
}

/// Inspector configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectorConfig {
    /// Enable the inspector dashboard
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Port for the inspector UI
    #[serde(default = "default_inspect_port")]
    pub port: u16,
}

impl Default for InspectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_inspect_port(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            token: None,
            subdomain: None,
            inspector: InspectorConfig::default(),
            local_host: default_host(),
            forward_timeout_secs: default_forward_timeout(),
        }
    }
}

fn default_server() -> String {
    "ws://localhost:8080/tunnel".to_string()
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_inspect_port() -> u16 {
    4040
}

fn default_forward_timeout() -> u64 {
    30
}

impl ClientConfig {
    /// Load configuration from a YAML file. Values are checked by
    /// `validate` only when a tunnel is started, so a broken file can still
    /// be repaired through `login`/`logout`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: ClientConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load from `path`, falling back to defaults when the file is absent
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Write the configuration, creating parent directories as needed
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }
        let content = serde_yaml::to_string(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let server = url::Url::parse(&self.server)
            .with_context(|| format!("Invalid server URL '{}'", self.server))?;
        match server.scheme() {
            "ws" | "wss" => {}
            other => anyhow::bail!("Server URL must use ws or wss, not '{}'", other),
        }
        if self.inspector.port == 0 {
            anyhow::bail!("Invalid inspector port 0");
        }
        if self.forward_timeout_secs == 0 {
            anyhow::bail!("forward_timeout_secs must be greater than zero");
        }
        if self.local_host.trim().is_empty() {
            anyhow::bail!("local_host cannot be empty");
        }
        Ok(())
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_secs(self.forward_timeout_secs)
    }

    /// Copy safe to print: the token is masked
    pub fn redacted(&self) -> Self {
        Self {
            token: self.token.as_deref().map(mask_token),
            ..self.clone()
        }
    }

    /// Default location: `<config dir>/relaytap/config.yml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("relaytap").join("config.yml"))
    }
}

impl TunnelSettings for ClientConfig {
    fn token(&self) -> Option<String> {
        self.token.clone()
    }

    fn server_endpoint(&self) -> String {
        self.server.clone()
    }

    fn default_subdomain(&self) -> Option<String> {
        self.subdomain.clone()
    }

    fn inspector_port(&self) -> u16 {
        self.inspector.port
    }
}

fn mask_token(token: &str) -> String {
    let visible: String = token.chars().take(4).collect();
    if token.chars().count() <= 4 {
        "****".to_string()
    } else {
        format!("{}****", visible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("relaytap-test-{}-{}", std::process::id(), name))
            .join("config.yml")
    }

    #[test]
    fn test_parse_config() {
        let yaml = r#"
server: wss://tunnel.example.com/tunnel
token: "test-token"
subdomain: my-api
inspector:
  enabled: false
  port: 4141
local_host: 127.0.0.1
forward_timeout_secs: 10
"#;
        let config: ClientConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server_endpoint(), "wss://tunnel.example.com/tunnel");
        assert_eq!(TunnelSettings::token(&config).as_deref(), Some("test-token"));
        assert_eq!(config.default_subdomain().as_deref(), Some("my-api"));
        assert_eq!(config.inspector_port(), 4141);
        assert!(!config.inspector.enabled);
        assert_eq!(config.forward_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_defaults() {
        let config: ClientConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.inspector_port(), 4040);
        assert!(config.inspector.enabled);
        assert_eq!(config.local_host, "localhost");
        assert!(TunnelSettings::token(&config).is_none());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ClientConfig::default();
        config.server = "http://tunnel.example.com".into();
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.forward_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.inspector.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let path = temp_path("save");
        let config = ClientConfig {
            token: Some("secret-token".into()),
            subdomain: Some("demo".into()),
            ..Default::default()
        };
        config.save(&path).unwrap();

        let loaded = ClientConfig::load(&path).unwrap();
        assert_eq!(loaded, config);

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let path = temp_path("missing");
        assert_eq!(ClientConfig::load_or_default(&path).unwrap(), ClientConfig::default());
    }

    #[test]
    fn test_load_keeps_invalid_values_for_repair() {
        let path = temp_path("invalid");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "server: http://tunnel.example.com\n").unwrap();

        let config = ClientConfig::load_or_default(&path).unwrap();
        assert_eq!(config.server, "http://tunnel.example.com");
        assert!(config.validate().is_err());

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_redacted_masks_token() {
        let config = ClientConfig {
            token: Some("abcd1234".into()),
            ..Default::default()
        };
        assert_eq!(config.redacted().token.as_deref(), Some("abcd****"));
        assert_eq!(mask_token("ab"), "****");
    }
}
