//! # 配置加载
//!
//! 三层叠加，后者覆盖前者：
//! 1. `KernelConfig::default()`
//! 2. TOML 文件（`CONDUCTOR_CONFIG`、`./conductor.toml` 或用户配置目录）
//! 3. `CONDUCTOR_*` 环境变量

use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;

use super::{KernelConfig, StorageBackend};
use crate::error::{KernelError, Result};

const DEFAULT_ENV_PREFIX: &str = "CONDUCTOR";
const LOCAL_CONFIG_FILE: &str = "conductor.toml";

/// Layered loader: defaults, then an optional TOML file, then env vars.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    config_path: PathBuf,
    env_prefix: String,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::with_path(discover_config_path())
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the file layer from `path` instead of searching for one.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: path.into(),
            env_prefix: DEFAULT_ENV_PREFIX.to_string(),
        }
    }

    /// Override the environment variable prefix
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    pub fn config_path(&self) -> &PathBuf {
        &self.config_path
    }

    pub fn load(&self) -> Result<KernelConfig> {
        let mut config = KernelConfig::default();
        // 文件缺失不算错误，直接使用默认值
        if self.config_path.is_file() {
            self.read_file()?.apply_to(&mut config);
        }
        self.apply_env(&mut config)?;

        config
            .validate()
            .map_err(|e| KernelError::configuration(format!("invalid configuration: {}", e)))?;

        tracing::debug!(path = %self.config_path.display(), "Configuration loaded");
        Ok(config)
    }

    fn read_file(&self) -> Result<FileConfig> {
        let shown = self.config_path.display();
        let raw = std::fs::read_to_string(&self.config_path).map_err(|e| {
            KernelError::configuration(format!("cannot read {}: {}", shown, e))
        })?;
        toml::from_str(&raw)
            .map_err(|e| KernelError::configuration(format!("malformed TOML in {}: {}", shown, e)))
    }

    /// `Ok(None)` when the variable is unset.
    fn env_value<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        let name = format!("{}_{}", self.env_prefix, key);
        match env::var(&name) {
            Ok(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
                KernelError::configuration(format!("{}={:?} rejected: {}", name, raw, e))
            }),
            Err(_) => Ok(None),
        }
    }

    fn apply_env(&self, config: &mut KernelConfig) -> Result<()> {
        let mailbox = &mut config.mailbox;
        set(&mut mailbox.debounce_ms, self.env_value("MAILBOX_DEBOUNCE_MS")?);
        set(&mut mailbox.default_wait_ms, self.env_value("MAILBOX_DEFAULT_WAIT_MS")?);
        set(&mut mailbox.max_wait_ms, self.env_value("MAILBOX_MAX_WAIT_MS")?);

        let session = &mut config.session;
        set(
            &mut session.liveness_timeout_secs,
            self.env_value("SESSION_LIVENESS_TIMEOUT_SECS")?,
        );
        set(
            &mut session.sweep_interval_secs,
            self.env_value("SESSION_SWEEP_INTERVAL_SECS")?,
        );

        set(
            &mut config.event_bus.max_history_size,
            self.env_value("EVENT_BUS_MAX_HISTORY_SIZE")?,
        );

        let storage = &mut config.storage;
        set(&mut storage.backend, self.env_value::<StorageBackend>("STORAGE_BACKEND")?);
        set(&mut storage.sqlite_path, self.env_value("STORAGE_SQLITE_PATH")?);
        set(&mut storage.busy_timeout_ms, self.env_value("STORAGE_BUSY_TIMEOUT_MS")?);
        Ok(())
    }
}

/// 查找顺序：`CONDUCTOR_CONFIG` > 当前目录 > 用户配置目录。
/// 都不存在时返回当前目录下的路径，加载时按缺失处理。
fn discover_config_path() -> PathBuf {
    if let Some(explicit) = env::var_os("CONDUCTOR_CONFIG") {
        return PathBuf::from(explicit);
    }

    let local = PathBuf::from(LOCAL_CONFIG_FILE);
    let user = dirs::config_dir().map(|d| d.join("conductor").join("config.toml"));
    std::iter::once(local.clone())
        .chain(user)
        .chain(std::iter::once(PathBuf::from("/etc/conductor/config.toml")))
        .find(|p| p.is_file())
        .unwrap_or(local)
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}

/// 文件层：每个字段都可省略
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    mailbox: FileMailbox,
    session: FileSession,
    event_bus: FileEventBus,
    storage: FileStorage,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileMailbox {
    debounce_ms: Option<u64>,
    default_wait_ms: Option<u64>,
    max_wait_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileSession {
    liveness_timeout_secs: Option<u64>,
    sweep_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileEventBus {
    max_history_size: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileStorage {
    backend: Option<StorageBackend>,
    sqlite_path: Option<PathBuf>,
    busy_timeout_ms: Option<u64>,
}

impl FileConfig {
    fn apply_to(self, config: &mut KernelConfig) {
        set(&mut config.mailbox.debounce_ms, self.mailbox.debounce_ms);
        set(&mut config.mailbox.default_wait_ms, self.mailbox.default_wait_ms);
        set(&mut config.mailbox.max_wait_ms, self.mailbox.max_wait_ms);

        set(
            &mut config.session.liveness_timeout_secs,
            self.session.liveness_timeout_secs,
        );
        set(
            &mut config.session.sweep_interval_secs,
            self.session.sweep_interval_secs,
        );

        set(
            &mut config.event_bus.max_history_size,
            self.event_bus.max_history_size,
        );

        set(&mut config.storage.backend, self.storage.backend);
        set(&mut config.storage.sqlite_path, self.storage.sqlite_path);
        set(&mut config.storage.busy_timeout_ms, self.storage.busy_timeout_ms);
    }
}
