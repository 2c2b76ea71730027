//! Shared wiring passed to every kernel component.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use conductor_traits::{EntityKind, Filter, Store, StoreExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::KernelConfig;
use crate::error::{KernelError, Result};
use crate::event_bus::EventBus;
use crate::events::{EventEnvelope, KernelEvent};
use crate::locks::LockManager;

/// One store, one bus, one config and one lock table, shared by the task
/// graph, session manager, queue engine and mailbox of a kernel instance.
#[derive(Clone)]
pub struct KernelContext {
    pub store: Arc<dyn Store>,
    pub bus: Arc<dyn EventBus>,
    pub config: Arc<KernelConfig>,
    pub locks: Arc<LockManager>,
}

impl KernelContext {
    pub fn new(store: Arc<dyn Store>, bus: Arc<dyn EventBus>, config: KernelConfig) -> Self {
        Self {
            store,
            bus,
            config: Arc::new(config),
            locks: Arc::new(LockManager::new()),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    pub fn publish(&self, event: KernelEvent) -> EventEnvelope {
        self.bus.publish(event)
    }

    pub(crate) async fn load<T>(&self, kind: EntityKind, id: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        Ok(self.store.get_as(kind, id).await?)
    }

    /// Like [`load`](Self::load) but a missing record is `NotFound`.
    pub(crate) async fn require<T>(&self, kind: EntityKind, id: &str) -> Result<T>
    where
        T: DeserializeOwned + Send,
    {
        self.load(kind, id)
            .await?
            .ok_or_else(|| KernelError::not_found(format!("{} {}", kind, id)))
    }

    pub(crate) async fn save<T>(&self, kind: EntityKind, id: &str, value: &T) -> Result<()>
    where
        T: Serialize + Sync,
    {
        Ok(self.store.put_as(kind, id, value).await?)
    }

    pub(crate) async fn list<T>(&self, kind: EntityKind, filter: &Filter) -> Result<Vec<T>>
    where
        T: DeserializeOwned + Send,
    {
        Ok(self.store.list_as(kind, filter).await?)
    }

    pub(crate) async fn remove(&self, kind: EntityKind, id: &str) -> Result<bool> {
        Ok(self.store.delete(kind, id).await?)
    }
}
