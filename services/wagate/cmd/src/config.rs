//! Configuration handling for the gateway.
//!
//! Values come from a YAML file, then environment variables, then command
//! line flags (applied in `main`). A missing or unparsable file falls back to
//! defaults with a warning.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use wagate_client::closure::codes;
use wagate_session::ReconnectPolicy;
use wagate_storage::StorageMode;

/// Gateway configuration (matches the YAML structure)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// HTTP control API
    pub server: ServerConfig,
    /// Credential persistence
    pub storage: StorageConfig,
    /// Reconnect backoff
    pub reconnect: ReconnectConfig,
    /// Pairing challenge output
    pub challenge: ChallengeConfig,
    /// Messaging client settings
    pub client: ClientConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address, e.g. 0.0.0.0:3000
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".to_string(),
        }
    }
}

/// Credential store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage mode: memory, file
    pub mode: String,
    /// Data directory for file storage
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mode: "file".to_string(),
            data_dir: PathBuf::from("./data"),
        }
    }
}

/// Reconnect configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first retry, e.g. 1s
    pub base_delay: String,
    /// Upper bound for retry delays, e.g. 30s
    pub max_delay: String,
    /// Closure codes that are never retried
    pub terminal_codes: Vec<u16>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: "1s".to_string(),
            max_delay: "30s".to_string(),
            terminal_codes: codes::DEFAULT_TERMINAL.to_vec(),
        }
    }
}

/// Pairing challenge configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChallengeConfig {
    /// Print a terminal QR code for every challenge
    pub print_terminal: bool,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            print_terminal: true,
        }
    }
}

/// Messaging client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Step between scripted pairing events of the development client
    pub pair_after: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            pair_after: "2s".to_string(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::read_file(config_path.as_ref());
        config.apply_environment_overrides();

        info!(
            "Final gateway configuration: bind={}, storage={} ({:?}), backoff={}..{}",
            config.server.bind,
            config.storage.mode,
            config.storage.data_dir,
            config.reconnect.base_delay,
            config.reconnect.max_delay
        );

        Ok(config)
    }

    /// Parse the config file alone, falling back to defaults
    fn read_file(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str::<GatewayConfig>(&content) {
                Ok(config) => {
                    info!("Loaded configuration from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("Failed to parse config file {:?} ({}), using defaults", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        }
    }

    /// Apply environment variable overrides
    fn apply_environment_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind) = lookup("WAGATE_BIND") {
            self.server.bind = bind;
            info!("Bind address overridden by environment: {}", self.server.bind);
        } else if let Some(port) = lookup("PORT") {
            if let Ok(port) = port.parse::<u16>() {
                let host = self
                    .server
                    .bind
                    .rsplit_once(':')
                    .map(|(host, _)| host)
                    .unwrap_or("0.0.0.0");
                self.server.bind = format!("{}:{}", host, port);
                info!("Port overridden by environment: {}", port);
            }
        }

        if let Some(mode) = lookup("WAGATE_STORAGE") {
            self.storage.mode = mode;
            info!("Storage mode overridden by environment: {}", self.storage.mode);
        }

        if let Some(data_dir) = lookup("WAGATE_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(data_dir);
            info!("Data directory overridden by environment: {:?}", self.storage.data_dir);
        }

        if let Some(ms) = lookup("WAGATE_BACKOFF_BASE_MS") {
            if let Ok(ms) = ms.parse::<u64>() {
                self.reconnect.base_delay = format!("{}ms", ms);
                info!("Backoff base overridden by environment: {}ms", ms);
            }
        }

        if let Some(ms) = lookup("WAGATE_BACKOFF_MAX_MS") {
            if let Ok(ms) = ms.parse::<u64>() {
                self.reconnect.max_delay = format!("{}ms", ms);
                info!("Backoff cap overridden by environment: {}ms", ms);
            }
        }
    }

    /// Credential store backend
    pub fn storage_mode(&self) -> Result<StorageMode> {
        Ok(StorageMode::parse(
            &self.storage.mode,
            self.storage.data_dir.clone(),
        )?)
    }

    /// Reconnect policy
    pub fn reconnect_policy(&self) -> Result<ReconnectPolicy> {
        let base_delay = parse_duration("reconnect.base_delay", &self.reconnect.base_delay)?;
        let max_delay = parse_duration("reconnect.max_delay", &self.reconnect.max_delay)?;
        if base_delay.is_zero() {
            bail!("reconnect.base_delay must be greater than zero");
        }
        if base_delay > max_delay {
            bail!(
                "reconnect.base_delay ({:?}) exceeds reconnect.max_delay ({:?})",
                base_delay,
                max_delay
            );
        }

        Ok(ReconnectPolicy {
            base_delay,
            max_delay,
            terminal_codes: self.reconnect.terminal_codes.iter().copied().collect(),
        })
    }

    /// Pairing step of the development client
    pub fn pair_after(&self) -> Result<Duration> {
        parse_duration("client.pair_after", &self.client.pair_after)
    }
}

fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value).with_context(|| format!("invalid duration for {}: {:?}", key, value))
}
