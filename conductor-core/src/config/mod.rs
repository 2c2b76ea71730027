//! # Kernel Configuration
//!
//! 优先级从高到低：
//!
//! ```text
//! CONDUCTOR_MAILBOX_DEBOUNCE_MS=500      环境变量
//!        │
//! conductor.toml  [mailbox] debounce_ms  配置文件
//!        │
//! KernelConfig::default()                内置默认值
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

mod loader;
mod storage;

pub use loader::ConfigLoader;
pub use storage::{StorageBackend, StorageConfig, DEFAULT_BUSY_TIMEOUT_MS};

use crate::error::{KernelError, Result};

/// Default debounce window for `wait_for_next`
pub const DEFAULT_DEBOUNCE_MS: u64 = 300;
/// Default long-poll timeout when the caller passes none
pub const DEFAULT_WAIT_MS: u64 = 30_000;
/// Upper bound on any long-poll
pub const DEFAULT_MAX_WAIT_MS: u64 = 300_000;
/// Default liveness timeout for silent sessions
pub const DEFAULT_LIVENESS_TIMEOUT_SECS: u64 = 120;
/// Default liveness sweep interval
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 15;
/// Default number of events kept for replay
pub const DEFAULT_MAX_HISTORY_SIZE: usize = 1000;

/// Everything the kernel reads at startup.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct KernelConfig {
    #[serde(default)]
    pub mailbox: MailboxConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub event_bus: EventBusConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

impl KernelConfig {
    /// Defaults, then the discovered file, then `CONDUCTOR_*`.
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Same layering with an explicit file.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self> {
        ConfigLoader::with_path(path).load()
    }

    pub fn validate(&self) -> Result<()> {
        self.mailbox.validate()?;
        self.session.validate()?;
        self.event_bus.validate()?;
        self.storage.validate()?;
        Ok(())
    }
}

/// 每个配置段自行校验
pub trait ValidateConfig {
    fn validate(&self) -> Result<()>;
}

/// 邮箱长轮询配置
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MailboxConfig {
    /// 首条消息到达后继续收集的窗口（毫秒）
    pub debounce_ms: u64,
    /// 调用方未指定超时时使用的默认值（毫秒）
    pub default_wait_ms: u64,
    /// 任何一次等待的上限（毫秒）
    pub max_wait_ms: u64,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            default_wait_ms: DEFAULT_WAIT_MS,
            max_wait_ms: DEFAULT_MAX_WAIT_MS,
        }
    }
}

impl MailboxConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Resolve a caller-supplied timeout against the default and the cap.
    pub fn clamp_wait(&self, requested_ms: Option<u64>) -> Duration {
        let ms = requested_ms.unwrap_or(self.default_wait_ms);
        Duration::from_millis(ms.min(self.max_wait_ms))
    }
}

impl ValidateConfig for MailboxConfig {
    fn validate(&self) -> Result<()> {
        validate_positive_duration(Duration::from_millis(self.max_wait_ms), "mailbox.max_wait_ms")?;
        if self.default_wait_ms > self.max_wait_ms {
            return Err(validation_error(format!(
                "mailbox.default_wait_ms ({}) exceeds mailbox.max_wait_ms ({})",
                self.default_wait_ms, self.max_wait_ms
            )));
        }
        if self.debounce_ms > self.max_wait_ms {
            return Err(validation_error(format!(
                "mailbox.debounce_ms ({}) exceeds mailbox.max_wait_ms ({})",
                self.debounce_ms, self.max_wait_ms
            )));
        }
        Ok(())
    }
}

/// Session liveness settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Seconds without a heartbeat before a session is considered dead
    pub liveness_timeout_secs: u64,
    /// How often the monitor sweeps
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            liveness_timeout_secs: DEFAULT_LIVENESS_TIMEOUT_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
        }
    }
}

impl SessionConfig {
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl ValidateConfig for SessionConfig {
    fn validate(&self) -> Result<()> {
        validate_positive_duration(self.liveness_timeout(), "session.liveness_timeout_secs")?;
        validate_positive_duration(self.sweep_interval(), "session.sweep_interval_secs")?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EventBusConfig {
    /// Events retained for bridge replay
    pub max_history_size: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            max_history_size: DEFAULT_MAX_HISTORY_SIZE,
        }
    }
}

impl ValidateConfig for EventBusConfig {
    fn validate(&self) -> Result<()> {
        if self.max_history_size == 0 {
            return Err(validation_error("event_bus.max_history_size must be greater than zero"));
        }
        Ok(())
    }
}

fn validation_error(msg: impl Into<String>) -> KernelError {
    KernelError::configuration(format!("Validation error: {}", msg.into()))
}

fn validate_positive_duration(duration: Duration, name: &str) -> Result<()> {
    if duration.is_zero() {
        return Err(validation_error(format!("{} must be greater than zero", name)));
    }
    Ok(())
}
