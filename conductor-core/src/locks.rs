// 内核锁
//
// 两级锁：
// - cascade gate（tokio RwLock）：跨实体操作取写锁，其余操作取读锁
// - entity lock（按实体 key 的 tokio Mutex）：单实体变更在读锁之下再串行化
//
// 每次公开调用只获取一次 gate。tokio 的 RwLock 写优先，重入读锁会死锁，
// 因此组件内部的级联步骤都走不加锁的内部函数。

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::time::timeout;

use crate::error::{KernelError, Result};

/// 默认锁获取超时
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Entity locks are only created under a read guard, so the map can be
/// cleared whenever the write guard is held. Clearing starts past this size.
const PRUNE_THRESHOLD: usize = 1024;

pub fn task_key(id: &str) -> String {
    format!("task:{}", id)
}

pub fn session_key(id: &str) -> String {
    format!("session:{}", id)
}

/// Status changes of all mail addressed to one session share this key.
pub fn mailbox_key(recipient_id: &str) -> String {
    format!("mailbox:{}", recipient_id)
}

pub struct LockManager {
    gate: RwLock<()>,
    entities: DashMap<String, Arc<Mutex<()>>>,
    timeout: Duration,
}

/// Held for a single-entity mutation. Field order matters: the entity lock is
/// released before the gate.
pub struct EntityGuard<'a> {
    _entity: OwnedMutexGuard<()>,
    _gate: RwLockReadGuard<'a, ()>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            gate: RwLock::new(()),
            entities: DashMap::new(),
            timeout,
        }
    }

    /// Shared side of the gate, for reads and for single-entity writes that
    /// need no per-entity ordering (creation of a fresh id).
    pub async fn read(&self) -> Result<RwLockReadGuard<'_, ()>> {
        timeout(self.timeout, self.gate.read())
            .await
            .map_err(|_| lock_timeout("cascade gate (read)", self.timeout))
    }

    /// Exclusive side of the gate, for operations touching several entities.
    pub async fn cascade(&self) -> Result<RwLockWriteGuard<'_, ()>> {
        let guard = timeout(self.timeout, self.gate.write())
            .await
            .map_err(|_| lock_timeout("cascade gate (write)", self.timeout))?;
        if self.entities.len() > PRUNE_THRESHOLD {
            self.entities.clear();
        }
        Ok(guard)
    }

    /// Shared gate plus the per-entity mutex for `key`.
    pub async fn entity(&self, key: &str) -> Result<EntityGuard<'_>> {
        let gate = self.read().await?;
        let entity = self.lock_key(key).await?;
        Ok(EntityGuard {
            _entity: entity,
            _gate: gate,
        })
    }

    /// Per-entity mutex for `key` inside a read section the caller already
    /// holds. Taking the gate a second time could deadlock behind a queued
    /// writer.
    pub async fn entity_within(
        &self,
        _gate: &RwLockReadGuard<'_, ()>,
        key: &str,
    ) -> Result<OwnedMutexGuard<()>> {
        self.lock_key(key).await
    }

    async fn lock_key(&self, key: &str) -> Result<OwnedMutexGuard<()>> {
        let mutex = self
            .entities
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        timeout(self.timeout, mutex.lock_owned())
            .await
            .map_err(|_| lock_timeout(key, self.timeout))
    }

    pub fn tracked_entities(&self) -> usize {
        self.entities.len()
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_timeout(what: &str, after: Duration) -> KernelError {
    tracing::warn!(lock = %what, timeout_ms = after.as_millis() as u64, "Lock acquisition timed out");
    KernelError::transient(format!("timed out acquiring lock on {} after {:?}", what, after))
}
