//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via RTHRIFT_CONFIG)
//! 3. Environment variables

use crate::server::ServerConfig;
use rthrift_protocol::{ProtocolConfig, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Wire protocol configuration.
    pub protocol: ProtocolConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("RTHRIFT_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        apply_protocol_overrides(&mut self.protocol);
    }

    /// Rejects settings the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol.recursion_limit == 0 {
            return Err(ConfigError::ValidationError(
                "protocol.recursion_limit must be greater than zero".to_string(),
            ));
        }
        if self.protocol.max_frame_size == 0 {
            return Err(ConfigError::ValidationError(
                "protocol.max_frame_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }

    /// Builds the runtime server settings.
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.network.bind_addr,
            idle_timeout: self.network.idle_timeout(),
            max_connections: self.network.max_connections,
            protocol: self.protocol.clone(),
        }
    }
}

/// Network configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Idle connection timeout in seconds (0 = never).
    pub idle_timeout_secs: u64,
    /// Maximum concurrent connections (0 = unlimited).
    pub max_connections: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            idle_timeout_secs: 300,
            max_connections: 1000,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("RTHRIFT_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Ok(timeout) = std::env::var("RTHRIFT_IDLE_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.idle_timeout_secs = secs;
            }
        }

        if let Ok(max) = std::env::var("RTHRIFT_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }
    }

    /// Returns the idle timeout, `None` when disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

fn apply_protocol_overrides(protocol: &mut ProtocolConfig) {
    if let Ok(transport) = std::env::var("RTHRIFT_TRANSPORT") {
        if let Ok(kind) = transport.parse() {
            protocol.transport = kind;
        }
    }

    if let Ok(name) = std::env::var("RTHRIFT_PROTOCOL") {
        if let Ok(id) = name.parse() {
            protocol.protocol = id;
        }
    }

    if let Ok(auto) = std::env::var("RTHRIFT_AUTO_DETECT") {
        protocol.auto_detect = auto == "1" || auto.to_lowercase() == "true";
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Serializes `SocketAddr` as a plain string in YAML.
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rthrift_protocol::{CompactVersion, ProtocolId, TransportKind};
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.bind_addr.port(), 9090);
        assert_eq!(
            config.network.idle_timeout(),
            Some(Duration::from_secs(300))
        );
        assert_eq!(config.protocol.transport, TransportKind::Framed);
        assert_eq!(config.protocol.protocol, ProtocolId::Binary);
        assert!(config.protocol.auto_detect);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let mut config = Config::default();
        config.network.max_connections = 8;
        config.protocol = config
            .protocol
            .with_transport(TransportKind::Header)
            .with_compact_version(CompactVersion::BigEndian);

        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "network:\n  bind_addr: \"0.0.0.0:7000\"\nprotocol:\n  transport: header\n  protocol: compact"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.network.bind_addr, "0.0.0.0:7000".parse().unwrap());
        assert_eq!(config.network.max_connections, 1000);
        assert_eq!(config.protocol.transport, TransportKind::Header);
        assert_eq!(config.protocol.protocol, ProtocolId::Compact);
        assert_eq!(config.protocol.recursion_limit, 64);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rthrift.yaml");
        let mut config = Config::default();
        config.network.idle_timeout_secs = 0;

        config.save(&path).unwrap();
        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.network.idle_timeout(), None);
    }

    #[test]
    fn test_missing_and_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.yaml");
        assert!(matches!(
            Config::from_file(&missing),
            Err(ConfigError::IoError(path, _)) if path == missing
        ));

        let bad = dir.path().join("bad.yaml");
        std::fs::write(&bad, "network: [").unwrap();
        assert!(matches!(
            Config::from_file(&bad),
            Err(ConfigError::ParseError(..))
        ));
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.protocol.recursion_limit = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("recursion_limit"));
    }

    #[test]
    fn test_env_overrides() {
        // The only test that touches these variables.
        std::env::set_var("RTHRIFT_BIND", "127.0.0.1:7777");
        std::env::set_var("RTHRIFT_MAX_CONNECTIONS", "3");
        std::env::set_var("RTHRIFT_IDLE_TIMEOUT", "9");
        std::env::set_var("RTHRIFT_TRANSPORT", "raw");
        std::env::set_var("RTHRIFT_PROTOCOL", "compact");
        std::env::set_var("RTHRIFT_AUTO_DETECT", "false");

        let config = Config::from_env();

        for var in [
            "RTHRIFT_BIND",
            "RTHRIFT_MAX_CONNECTIONS",
            "RTHRIFT_IDLE_TIMEOUT",
            "RTHRIFT_TRANSPORT",
            "RTHRIFT_PROTOCOL",
            "RTHRIFT_AUTO_DETECT",
        ] {
            std::env::remove_var(var);
        }

        assert_eq!(config.network.bind_addr.port(), 7777);
        assert_eq!(config.network.max_connections, 3);
        assert_eq!(config.network.idle_timeout_secs, 9);
        assert_eq!(config.protocol.transport, TransportKind::Raw);
        assert_eq!(config.protocol.protocol, ProtocolId::Compact);
        assert!(!config.protocol.auto_detect);

        let server = config.server_config();
        assert_eq!(server.max_connections, 3);
        assert_eq!(server.idle_timeout, Some(Duration::from_secs(9)));
    }
}
