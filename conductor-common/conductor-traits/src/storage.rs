use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::filter::Filter;

/// Record families the kernel persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    Task,
    Session,
    Queue,
    Mail,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Task => "task",
            EntityKind::Session => "session",
            EntityKind::Queue => "queue",
            EntityKind::Mail => "mail",
        }
    }

    pub fn all() -> [EntityKind; 4] {
        [
            EntityKind::Task,
            EntityKind::Session,
            EntityKind::Queue,
            EntityKind::Mail,
        ]
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Backend unreachable / locked / I/O failure. Safe to retry.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A stored record could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Persistence port.
///
/// Only single-record read/write is assumed atomic; the kernel never relies on
/// multi-record transactions.
#[async_trait]
pub trait Store: Send + Sync {
    fn name(&self) -> &str;

    async fn get(&self, kind: EntityKind, id: &str) -> StoreResult<Option<Value>>;
    async fn list(&self, kind: EntityKind, filter: &Filter) -> StoreResult<Vec<Value>>;
    async fn put(&self, kind: EntityKind, id: &str, value: Value) -> StoreResult<()>;
    async fn delete(&self, kind: EntityKind, id: &str) -> StoreResult<bool>;

    async fn health_check(&self) -> bool;
}

/// Typed helpers on top of [`Store`].
#[async_trait]
pub trait StoreExt: Store {
    async fn get_as<T>(&self, kind: EntityKind, id: &str) -> StoreResult<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        match self.get(kind, id).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn list_as<T>(&self, kind: EntityKind, filter: &Filter) -> StoreResult<Vec<T>>
    where
        T: DeserializeOwned + Send,
    {
        self.list(kind, filter)
            .await?
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(StoreError::from))
            .collect()
    }

    async fn put_as<T>(&self, kind: EntityKind, id: &str, value: &T) -> StoreResult<()>
    where
        T: Serialize + Sync,
    {
        let value = serde_json::to_value(value)?;
        self.put(kind, id, value).await
    }
}

impl<S: Store + ?Sized> StoreExt for S {}
