//! SQLite-backed store.
//!
//! One `entities` table keyed by `(kind, id)` holding JSON bodies. Filters are
//! evaluated on decoded rows of the requested kind, which keeps the adapter
//! independent of the record shapes.

use async_trait::async_trait;
use conductor_traits::{EntityKind, Filter, Store, StoreError, StoreResult};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS entities (
    kind TEXT NOT NULL,
    id   TEXT NOT NULL,
    body TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (kind, id)
);
";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            }
        }
        let conn = Connection::open(path).map_err(unavailable)?;
        conn.busy_timeout(busy_timeout).map_err(unavailable)?;
        let _mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(unavailable)?;
        debug!(path = %path.display(), "Opened sqlite store");
        Self::init(conn)
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(unavailable)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA).map_err(unavailable)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn unavailable(err: rusqlite::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

#[async_trait]
impl Store for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get(&self, kind: EntityKind, id: &str) -> StoreResult<Option<Value>> {
        let conn = self.conn.lock();
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM entities WHERE kind = ?1 AND id = ?2",
                params![kind.as_str(), id],
                |row| row.get(0),
            )
            .optional()
            .map_err(unavailable)?;

        match body {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, kind: EntityKind, filter: &Filter) -> StoreResult<Vec<Value>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT body FROM entities WHERE kind = ?1")
            .map_err(unavailable)?;
        let rows = stmt
            .query_map(params![kind.as_str()], |row| row.get::<_, String>(0))
            .map_err(unavailable)?;

        let mut records = Vec::new();
        for row in rows {
            let body = row.map_err(unavailable)?;
            let value: Value = serde_json::from_str(&body)?;
            if filter.matches(&value) {
                records.push(value);
            }
        }
        Ok(records)
    }

    async fn put(&self, kind: EntityKind, id: &str, value: Value) -> StoreResult<()> {
        let body = serde_json::to_string(&value)?;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO entities (kind, id, body, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(kind, id) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at",
            params![kind.as_str(), id, body, now],
        )
        .map_err(unavailable)?;
        Ok(())
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let count = conn
            .execute(
                "DELETE FROM entities WHERE kind = ?1 AND id = ?2",
                params![kind.as_str(), id],
            )
            .map_err(unavailable)?;
        Ok(count > 0)
    }

    async fn health_check(&self) -> bool {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .is_ok()
    }
}
