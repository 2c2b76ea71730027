//! Persistence backend selection.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::{validation_error, ValidateConfig};
use crate::error::Result;

/// Default SQLite busy timeout
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sqlite,
}

impl std::str::FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(StorageBackend::Memory),
            "sqlite" => Ok(StorageBackend::Sqlite),
            other => Err(format!("unknown storage backend '{}'", other)),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Database file used by the sqlite backend
    pub sqlite_path: PathBuf,
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            sqlite_path: default_sqlite_path(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

impl StorageConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

fn default_sqlite_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("conductor").join("conductor.db"))
        .unwrap_or_else(|| PathBuf::from("conductor.db"))
}

impl ValidateConfig for StorageConfig {
    fn validate(&self) -> Result<()> {
        if self.backend == StorageBackend::Sqlite && self.sqlite_path.as_os_str().is_empty() {
            return Err(validation_error("storage.sqlite_path cannot be empty"));
        }
        Ok(())
    }
}
