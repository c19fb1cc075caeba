//! Bridge configuration.
//!
//! Values are resolved in this order, later sources winning:
//!
//! 1. built-in defaults
//! 2. the TOML file: an explicit path, else `nikobus-bridge.toml` in the
//!    working directory when present
//! 3. environment variables (`NIKOBUS_CONNECTION`, `NIKOBUS_BAUD_RATE`,
//!    `NIKOBUS_CONFIG_DIR`)
//! 4. command-line flags, applied by the binary
//!
//! Durations in the file are milliseconds.
//!
//! ```toml
//! [connection]
//! connection_string = "192.168.2.50:9999"
//! baud_rate = 9600
//!
//! [discovery]
//! quiet_period_ms = 5000
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::debug;
use serde::Deserialize;

use nikobus_protocol::ModuleAddress;

use crate::command::CommandConfig;
use crate::discovery::DiscoveryConfig;
use crate::error::{BridgeError, Result};
use crate::transport::ConnectionConfig;

/// File looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "nikobus-bridge.toml";

pub const ENV_CONNECTION: &str = "NIKOBUS_CONNECTION";
pub const ENV_BAUD_RATE: &str = "NIKOBUS_BAUD_RATE";
pub const ENV_CONFIG_DIR: &str = "NIKOBUS_CONFIG_DIR";

/// Where the JSON documents live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub config_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub log_dir: PathBuf,
    pub retention_days: u64,
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            retention_days: 7,
            level: None,
        }
    }
}

/// Fully resolved configuration.
#[derive(Debug, Clone, Default)]
pub struct BridgeConfig {
    pub connection: ConnectionConfig,
    pub command: CommandConfig,
    pub discovery: DiscoveryConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

/// Configuration file format.
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub connection: ConnectionSection,
    #[serde(default)]
    pub command: CommandSection,
    #[serde(default)]
    pub discovery: DiscoverySection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConnectionSection {
    pub connection_string: Option<String>,
    pub baud_rate: Option<u32>,
    pub connect_timeout_ms: Option<u64>,
    pub read_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct CommandSection {
    pub max_attempts: Option<u32>,
    pub ack_wait_timeout_ms: Option<u64>,
    pub read_timeout_ms: Option<u64>,
    pub command_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct DiscoverySection {
    pub controller_address: Option<String>,
    pub quiet_period_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct StorageSection {
    pub config_dir: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct LoggingSection {
    pub log_dir: Option<String>,
    pub retention_days: Option<u64>,
    pub level: Option<String>,
}

/// Parse a configuration file.
pub fn load_config(path: &Path) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .map_err(|e| BridgeError::Config(format!("cannot read {}: {}", path.display(), e)))?;
    parse_config(&contents)
        .map_err(|e| BridgeError::Config(format!("{}: {}", path.display(), e)))
}

/// Parse configuration text.
pub fn parse_config(contents: &str) -> Result<ConfigFile> {
    toml::from_str(contents).map_err(|e| BridgeError::Config(e.to_string()))
}

/// Explicit path, else the default file when it exists.
pub fn find_config_file(explicit: Option<&Path>) -> Option<PathBuf> {
    explicit.map(Path::to_path_buf).or_else(|| {
        let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
        default_path.exists().then_some(default_path)
    })
}

impl BridgeConfig {
    /// Resolve defaults, file and environment.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(path) = find_config_file(explicit) {
            debug!("Loading configuration from {}", path.display());
            config.apply_file(load_config(&path)?)?;
        }
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Overlay the values present in `file`.
    pub fn apply_file(&mut self, file: ConfigFile) -> Result<()> {
        let ms = Duration::from_millis;

        let c = file.connection;
        if let Some(v) = c.connection_string {
            self.connection.connection_string = v;
        }
        if let Some(v) = c.baud_rate {
            self.connection.baud_rate = v;
        }
        if let Some(v) = c.connect_timeout_ms {
            self.connection.connect_timeout = ms(v);
        }
        if let Some(v) = c.read_timeout_ms {
            self.connection.read_timeout = ms(v);
        }

        let c = file.command;
        if let Some(v) = c.max_attempts {
            if v == 0 {
                return Err(BridgeError::Config("command.max_attempts must be at least 1".into()));
            }
            self.command.max_attempts = v;
        }
        if let Some(v) = c.ack_wait_timeout_ms {
            self.command.ack_wait_timeout = ms(v);
        }
        if let Some(v) = c.read_timeout_ms {
            self.command.read_timeout = ms(v);
        }
        if let Some(v) = c.command_delay_ms {
            self.command.command_delay = ms(v);
        }

        let d = file.discovery;
        if let Some(v) = d.controller_address {
            let address = ModuleAddress::new(&v)
                .map_err(|e| BridgeError::Config(format!("discovery.controller_address: {}", e)))?;
            self.discovery.controller_address = address.as_str().to_string();
        }
        if let Some(v) = d.quiet_period_ms {
            self.discovery.quiet_period = ms(v);
        }

        if let Some(v) = file.storage.config_dir {
            self.storage.config_dir = PathBuf::from(v);
        }

        let l = file.logging;
        if let Some(v) = l.log_dir {
            self.logging.log_dir = PathBuf::from(v);
        }
        if let Some(v) = l.retention_days {
            self.logging.retention_days = v;
        }
        if l.level.is_some() {
            self.logging.level = l.level;
        }
        Ok(())
    }

    /// Overlay environment variables read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup(ENV_CONNECTION).filter(|v| !v.trim().is_empty()) {
            self.connection.connection_string = v.trim().to_string();
        }
        if let Some(v) = lookup(ENV_BAUD_RATE) {
            self.connection.baud_rate = v
                .trim()
                .parse()
                .map_err(|_| BridgeError::Config(format!("{}={:?} is not a number", ENV_BAUD_RATE, v)))?;
        }
        if let Some(v) = lookup(ENV_CONFIG_DIR).filter(|v| !v.trim().is_empty()) {
            self.storage.config_dir = PathBuf::from(v.trim());
        }
        Ok(())
    }
}
