use async_trait::async_trait;
use conductor_traits::{EntityKind, Filter, Store, StoreResult};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;

/// In-process store. The default backend and the one tests use.
pub struct MemoryStore {
    data: RwLock<HashMap<EntityKind, HashMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
        }
    }

    /// Number of records of one kind.
    pub fn len(&self, kind: EntityKind) -> usize {
        self.data.read().get(&kind).map(|m| m.len()).unwrap_or(0)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, kind: EntityKind, id: &str) -> StoreResult<Option<Value>> {
        let data = self.data.read();
        Ok(data.get(&kind).and_then(|m| m.get(id)).cloned())
    }

    async fn list(&self, kind: EntityKind, filter: &Filter) -> StoreResult<Vec<Value>> {
        let data = self.data.read();
        let records = data
            .get(&kind)
            .map(|m| m.values().filter(|v| filter.matches(v)).cloned().collect())
            .unwrap_or_default();
        Ok(records)
    }

    async fn put(&self, kind: EntityKind, id: &str, value: Value) -> StoreResult<()> {
        let mut data = self.data.write();
        data.entry(kind).or_default().insert(id.to_string(), value);
        Ok(())
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> StoreResult<bool> {
        let mut data = self.data.write();
        Ok(data
            .get_mut(&kind)
            .map(|m| m.remove(id).is_some())
            .unwrap_or(false))
    }

    async fn health_check(&self) -> bool {
        true
    }
}
