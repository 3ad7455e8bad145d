//! Configuration system for ferry.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $FERRY_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/ferry/config.toml
//!   3. ~/.config/ferry/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::wire::{DEFAULT_CHUNK_CAPACITY, MAX_PAYLOAD_FIELD};

/// First port a node tries to bind.
pub const DEFAULT_BASE_PORT: u16 = 27890;

/// Default ceiling on non-primary connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 4;

/// Default number of consecutive ports a peer tries before giving up.
pub const DEFAULT_BIND_ATTEMPTS: u16 = 100;

/// Name of the staging directory for in-flight transfers.
pub const STAGING_DIR_NAME: &str = "p2p-staging";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FerryConfig {
    pub network: NetworkConfig,
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the primary socket listens on.
    pub listen_host: String,
    /// First port tried. 0 = OS-assigned.
    pub base_port: u16,
    /// Consecutive ports tried from `base_port`.
    pub bind_attempts: u16,
    /// Maximum number of non-primary connections.
    pub max_connections: usize,
    /// Host advertised to the directory. Empty = let the directory use the
    /// address it observes.
    pub public_host: String,
    /// Directory server `host:port`.
    pub directory_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Payload bytes per chunk.
    pub chunk_capacity: usize,
    /// Where parts of in-flight downloads are kept.
    pub staging_dir: PathBuf,
    /// Where completed downloads land.
    pub download_dir: PathBuf,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for FerryConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            transfer: TransferConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".into(),
            base_port: DEFAULT_BASE_PORT,
            bind_attempts: DEFAULT_BIND_ATTEMPTS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            public_host: String::new(),
            directory_addr: format!("127.0.0.1:{DEFAULT_BASE_PORT}"),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_capacity: DEFAULT_CHUNK_CAPACITY,
            staging_dir: data_dir().join(STAGING_DIR_NAME),
            download_dir: data_dir().join("downloads"),
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("ferry")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("ferry")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl FerryConfig {
    /// Load config: env vars → file → defaults. The result is validated.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&path, &text)?
        } else {
            FerryConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn from_toml(path: &std::path::Path, text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("FERRY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&FerryConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject settings the wire format or the node cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let capacity = self.transfer.chunk_capacity;
        if capacity == 0 || capacity > MAX_PAYLOAD_FIELD {
            return Err(ConfigError::Invalid {
                field: "transfer.chunk_capacity",
                reason: format!("{capacity} is outside 1..={MAX_PAYLOAD_FIELD}"),
            });
        }
        if self.network.max_connections == 0 {
            return Err(ConfigError::Invalid {
                field: "network.max_connections",
                reason: "must allow at least one connection".into(),
            });
        }
        Ok(())
    }

    /// Apply FERRY_* env var overrides. Unparseable numbers are ignored.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("FERRY_NETWORK__LISTEN_HOST") {
            self.network.listen_host = v;
        }
        if let Some(p) = lookup("FERRY_NETWORK__BASE_PORT").and_then(|v| v.parse().ok()) {
            self.network.base_port = p;
        }
        if let Some(n) = lookup("FERRY_NETWORK__BIND_ATTEMPTS").and_then(|v| v.parse().ok()) {
            self.network.bind_attempts = n;
        }
        if let Some(n) = lookup("FERRY_NETWORK__MAX_CONNECTIONS").and_then(|v| v.parse().ok()) {
            self.network.max_connections = n;
        }
        if let Some(v) = lookup("FERRY_NETWORK__PUBLIC_HOST") {
            self.network.public_host = v;
        }
        if let Some(v) = lookup("FERRY_NETWORK__DIRECTORY_ADDR") {
            self.network.directory_addr = v;
        }
        if let Some(n) = lookup("FERRY_TRANSFER__CHUNK_CAPACITY").and_then(|v| v.parse().ok()) {
            self.transfer.chunk_capacity = n;
        }
        if let Some(v) = lookup("FERRY_TRANSFER__STAGING_DIR") {
            self.transfer.staging_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FERRY_TRANSFER__DOWNLOAD_DIR") {
            self.transfer.download_dir = PathBuf::from(v);
        }
    }
}
