use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::node::NodeId;
use crate::transport::{BusOpener, CanBus, SocketCanBus};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not determine config file path")]
    NoConfigPath,
    #[error("Config file I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Channel and client settings, stored as TOML
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// SocketCAN interface name
    pub interface: String,
    /// Informational only: SocketCAN bit rates are set with `ip link`
    pub bitrate: Option<u32>,
    /// Probe interval while the channel is down, and monitor tick
    pub poll_interval_ms: u64,
    pub sdo_timeout_ms: u64,
    /// Default node for operator commands
    pub node_id: u8,
    pub enable_logging: bool,
    pub log_directory: Option<String>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            interface: "can0".to_string(),
            bitrate: None,
            poll_interval_ms: 100,
            sdo_timeout_ms: 100,
            node_id: 1,
            enable_logging: false,
            log_directory: None,
        }
    }
}

impl ChannelConfig {
    /// Get the path to the config file
    pub fn config_file_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "canopen", "canopen-client")
            .map(|proj_dirs| proj_dirs.config_dir().join("config.toml"))
    }

    /// Load from the default location, falling back to defaults on any error
    pub fn load() -> Self {
        let Some(config_path) = Self::config_file_path() else {
            return Self::default();
        };
        if !config_path.exists() {
            info!("Using default configuration");
            return Self::default();
        }

        match Self::load_from(&config_path) {
            Ok(config) => {
                info!("Loaded configuration from {:?}", config_path);
                config
            }
            Err(e) => {
                warn!("{} ({:?}), using defaults", e, config_path);
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Save to the default location
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let config_path = Self::config_file_path().ok_or(ConfigError::NoConfigPath)?;
        self.save_to(&config_path)?;
        Ok(config_path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Get the default log directory path
    pub fn default_log_directory() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "canopen", "canopen-client")
            .map(|proj_dirs| proj_dirs.data_local_dir().join("logs"))
    }

    /// Get the log directory, using the default if not set
    pub fn get_log_directory(&self) -> Option<PathBuf> {
        match self.log_directory {
            Some(ref dir) => Some(PathBuf::from(dir)),
            None => Self::default_log_directory(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn sdo_timeout(&self) -> Duration {
        Duration::from_millis(self.sdo_timeout_ms)
    }

    pub fn node(&self) -> NodeId {
        NodeId::clamped(self.node_id)
    }
}

impl BusOpener for ChannelConfig {
    fn open(&self) -> io::Result<Arc<dyn CanBus>> {
        Ok(Arc::new(SocketCanBus::open(&self.interface)?))
    }

    fn describe(&self) -> String {
        self.interface.clone()
    }
}
