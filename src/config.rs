//! Configuration handling for the Moshi Connect service

use crate::ipc::codec::DEFAULT_MAX_FRAME_BYTES;
use crate::transport::{self, DEFAULT_SERVICE_NAME};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const CONFIG_FILE_NAME: &str = "moshi-connect.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Channel name; the socket or pipe address is derived from it.
    pub service_name: String,
    /// Full channel address, overriding `service_name`.
    pub address: Option<String>,
    /// OpenConnect binary, a bare name is searched on PATH.
    pub executable: PathBuf,
    /// Delay between tunnel attach and route changes.
    pub route_settle_ms: u64,
    pub terminate_timeout_ms: u64,
    pub kill_timeout_ms: u64,
    pub max_frame_bytes: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            address: None,
            executable: PathBuf::from("openconnect"),
            route_settle_ms: 2000,
            terminate_timeout_ms: 3000,
            kill_timeout_ms: 2000,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl ServiceConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ServiceConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// First existing config file: working directory, then the user config dir.
    pub fn locate() -> Option<PathBuf> {
        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.is_file() {
            return Some(local);
        }
        dirs::config_dir()
            .map(|dir| dir.join("moshi-connect").join("config.toml"))
            .filter(|path| path.is_file())
    }

    /// Load `path` if given, otherwise the located file, otherwise defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => match Self::locate() {
                Some(found) => Self::load(&found),
                None => Ok(Self::default()),
            },
        }
    }

    pub fn address(&self) -> String {
        self.address
            .clone()
            .unwrap_or_else(|| transport::service_address(&self.service_name))
    }

    pub fn route_settle_delay(&self) -> Duration {
        Duration::from_millis(self.route_settle_ms)
    }

    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_millis(self.terminate_timeout_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }
}
