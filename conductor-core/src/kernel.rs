//! # 内核实例
//!
//! 把存储、事件总线、配置和锁表装配到一起，并向外暴露各组件。
//!
//! ```text
//! KernelConfig
//! ├── Store (MemoryStore | SqliteStore)
//! ├── EventBus (MemoryEventBus, bounded history)
//! ├── LockManager
//! └── TaskGraph / SessionManager / QueueEngine / Mailbox / NotificationBridge
//! ```
//!
//! ```rust,no_run
//! # async fn demo() -> conductor_core::Result<()> {
//! use conductor_core::{config::KernelConfig, Kernel};
//! use conductor_types::{Actor, CreateTaskInput};
//!
//! let kernel = Kernel::from_config(KernelConfig::load()?)?;
//! let task = kernel
//!     .tasks()
//!     .create_task(CreateTaskInput::new("p1", "write docs"), &Actor::operator())
//!     .await?;
//! # let _ = task;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use conductor_storage::{MemoryStore, SqliteStore};
use conductor_traits::Store;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bridge::NotificationBridge;
use crate::config::{KernelConfig, StorageBackend, StorageConfig};
use crate::context::KernelContext;
use crate::error::Result;
use crate::event_bus::{EventBus, MemoryEventBus};
use crate::mailbox::Mailbox;
use crate::queue::QueueEngine;
use crate::session::{spawn_liveness_monitor, LivenessMonitor, SessionManager};
use crate::task::TaskGraph;

pub struct Kernel {
    ctx: KernelContext,
    bus: MemoryEventBus,
    tasks: TaskGraph,
    sessions: SessionManager,
    queue: QueueEngine,
    mailbox: Mailbox,
    bridge: NotificationBridge,
}

impl Kernel {
    /// Wire a kernel around an existing store.
    pub fn new(store: Arc<dyn Store>, config: KernelConfig) -> Result<Self> {
        config.validate()?;
        let bus = MemoryEventBus::with_capacity(config.event_bus.max_history_size);
        let bus_ref: Arc<dyn EventBus> = Arc::new(bus.clone());
        let ctx = KernelContext::new(store, bus_ref.clone(), config);

        info!(
            store = ctx.store.name(),
            history = ctx.config.event_bus.max_history_size,
            "Kernel initialized"
        );
        Ok(Self {
            tasks: TaskGraph::new(ctx.clone()),
            sessions: SessionManager::new(ctx.clone()),
            queue: QueueEngine::new(ctx.clone()),
            mailbox: Mailbox::new(ctx.clone()),
            bridge: NotificationBridge::new(bus_ref),
            bus,
            ctx,
        })
    }

    /// Open the configured store and wire a kernel around it.
    pub fn from_config(config: KernelConfig) -> Result<Self> {
        let store = open_store(&config.storage)?;
        Self::new(store, config)
    }

    /// In-memory kernel with default settings.
    pub fn in_memory() -> Result<Self> {
        Self::new(Arc::new(MemoryStore::new()), KernelConfig::default())
    }

    pub fn tasks(&self) -> &TaskGraph {
        &self.tasks
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn queue(&self) -> &QueueEngine {
        &self.queue
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    pub fn bridge(&self) -> &NotificationBridge {
        &self.bridge
    }

    pub fn bus(&self) -> &MemoryEventBus {
        &self.bus
    }

    pub fn config(&self) -> &KernelConfig {
        &self.ctx.config
    }

    pub fn context(&self) -> &KernelContext {
        &self.ctx
    }

    /// Start the periodic liveness sweep using `session.sweep_interval_secs`.
    pub fn start_liveness_monitor(&self, token: CancellationToken) -> LivenessMonitor {
        spawn_liveness_monitor(
            self.sessions.clone(),
            self.ctx.config.session.sweep_interval(),
            token,
        )
    }

    pub async fn health_check(&self) -> bool {
        self.ctx.store.health_check().await
    }
}

/// Build the store selected by `config.backend`.
pub fn open_store(config: &StorageConfig) -> Result<Arc<dyn Store>> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StorageBackend::Sqlite => {
            info!(path = %config.sqlite_path.display(), "Opening sqlite store");
            let store = SqliteStore::open(&config.sqlite_path, config.busy_timeout())?;
            Ok(Arc::new(store))
        }
    }
}
