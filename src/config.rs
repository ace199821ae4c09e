//! Configuration file support.
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0"
//! port = 54555
//! username = "admin"
//! password = "admin"
//!
//! [transfer]
//! chunk_size = 65536
//! connect_timeout_secs = 10
//! progress_interval = 16
//! ```

use crate::chunk::{CHUNK_SIZE, MAX_CHUNK_SIZE};
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default port for the sync service
pub const DEFAULT_PORT: u16 = 54555;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub server: ServerConfig,
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            username: "admin".to_string(),
            password: "admin".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Bytes per file chunk
    pub chunk_size: usize,
    pub connect_timeout_secs: u64,
    /// Report chunk progress every N chunks
    pub progress_interval: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            connect_timeout_secs: 10,
            progress_interval: 16,
        }
    }
}

impl TransferConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl SyncConfig {
    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: SyncConfig =
            toml::from_str(text).map_err(|e| SyncError::Config(format!("Invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let chunk_size = self.transfer.chunk_size;
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(SyncError::Config(format!(
                "chunk_size must be between 1 and {} bytes, got {}",
                MAX_CHUNK_SIZE, chunk_size
            )));
        }
        if self.transfer.connect_timeout_secs == 0 {
            return Err(SyncError::Config(
                "connect_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.transfer.progress_interval == 0 {
            return Err(SyncError::Config(
                "progress_interval must be greater than 0".to_string(),
            ));
        }
        if self.server.username.is_empty() {
            return Err(SyncError::Config("server.username must not be empty".to_string()));
        }
        Ok(())
    }
}
