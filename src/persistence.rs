//! Persistence adapter (spec.md §4.3 "Durability").
//!
//! The engine talks to storage through a narrow key/value interface so the
//! host can swap backends without touching the sync engine. The default
//! implementation follows the teacher crate's `Db { conn: Mutex<Connection> }`
//! shape (`src/db.rs`), trading its domain tables for a single flat
//! `room_state(room_id, path, value)` table keyed by dotted path.

use std::collections::BTreeMap;
use std::sync::Mutex;

use rusqlite::{params, Connection};
use serde_json::Value;

use crate::error::EngineResult;

/// Narrow KV contract the sync engine's persist flush writes through.
/// Implementors must be safe to share across the tokio runtime's worker
/// threads, since flushes happen from spawned tasks.
pub trait PersistenceAdapter: Send + Sync {
    fn get(&self, path: &str) -> EngineResult<Option<Value>>;
    fn put(&self, path: &str, value: &Value) -> EngineResult<()>;
    fn delete(&self, path: &str) -> EngineResult<()>;
    /// All paths stored under `prefix` (used to reconstruct a room's tree
    /// on load — spec.md §9 "loaders reconstruct the tree from the leaf
    /// map").
    fn list(&self, prefix: &str) -> EngineResult<Vec<(String, Value)>>;
}

/// SQLite-backed adapter, one table shared by every room, partitioned by a
/// `room_id` column the caller threads through the path (`"{room_id}:{rest}"`
/// is the convention used by `Room::persistence_scope`).
pub struct SqliteAdapter {
    conn: Mutex<Connection>,
}

impl SqliteAdapter {
    pub fn open(path: &str) -> EngineResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS room_state (
                path  TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> EngineResult<Self> {
        Self::open(":memory:")
    }
}

impl PersistenceAdapter for SqliteAdapter {
    fn get(&self, path: &str) -> EngineResult<Option<Value>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT value FROM room_state WHERE path = ?1")?;
        let mut rows = stmt.query(params![path])?;
        if let Some(row) = rows.next()? {
            let raw: String = row.get(0)?;
            let value: Value = serde_json::from_str(&raw)
                .map_err(|e| crate::error::EngineError::Infrastructure(e.to_string()))?;
            Ok(Some(value))
        } else {
            Ok(None)
        }
    }

    fn put(&self, path: &str, value: &Value) -> EngineResult<()> {
        let raw = serde_json::to_string(value)
            .map_err(|e| crate::error::EngineError::Infrastructure(e.to_string()))?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO room_state (path, value) VALUES (?1, ?2)
             ON CONFLICT(path) DO UPDATE SET value = excluded.value",
            params![path, raw],
        )?;
        Ok(())
    }

    fn delete(&self, path: &str) -> EngineResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM room_state WHERE path = ?1", params![path])?;
        Ok(())
    }

    fn list(&self, prefix: &str) -> EngineResult<Vec<(String, Value)>> {
        let conn = self.conn.lock().unwrap();
        let like = format!("{prefix}%");
        let mut stmt = conn.prepare("SELECT path, value FROM room_state WHERE path LIKE ?1")?;
        let rows = stmt.query_map(params![like], |row| {
            let path: String = row.get(0)?;
            let raw: String = row.get(1)?;
            Ok((path, raw))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (path, raw) = row?;
            let value: Value = serde_json::from_str(&raw)
                .map_err(|e| crate::error::EngineError::Infrastructure(e.to_string()))?;
            out.push((path, value));
        }
        Ok(out)
    }
}

/// In-process adapter for unit/integration tests that don't need a real
/// file, mirroring the teacher's use of `Db::open_in_memory()`-style test
/// fixtures without touching disk.
pub struct InMemoryAdapter {
    entries: Mutex<BTreeMap<String, Value>>,
}

impl InMemoryAdapter {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
        }
    }
}

impl Default for InMemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistenceAdapter for InMemoryAdapter {
    fn get(&self, path: &str) -> EngineResult<Option<Value>> {
        Ok(self.entries.lock().unwrap().get(path).cloned())
    }

    fn put(&self, path: &str, value: &Value) -> EngineResult<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(path.to_string(), value.clone());
        Ok(())
    }

    fn delete(&self, path: &str) -> EngineResult<()> {
        self.entries.lock().unwrap().remove(path);
        Ok(())
    }

    fn list(&self, prefix: &str) -> EngineResult<Vec<(String, Value)>> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(path, _)| path.starts_with(prefix))
            .map(|(path, value)| (path.clone(), value.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_adapter_put_get_delete_roundtrip() {
        let adapter = SqliteAdapter::open_in_memory().unwrap();
        adapter.put("room1.count", &Value::from(5)).unwrap();
        assert_eq!(adapter.get("room1.count").unwrap(), Some(Value::from(5)));
        adapter.delete("room1.count").unwrap();
        assert_eq!(adapter.get("room1.count").unwrap(), None);
    }

    #[test]
    fn sqlite_adapter_list_filters_by_prefix() {
        let adapter = SqliteAdapter::open_in_memory().unwrap();
        adapter.put("room1.count", &Value::from(1)).unwrap();
        adapter.put("room1.users.a", &Value::from("x")).unwrap();
        adapter.put("room2.count", &Value::from(9)).unwrap();
        let listed = adapter.list("room1.").unwrap();
        assert_eq!(listed.len(), 2);
    }

    #[test]
    fn in_memory_adapter_roundtrip() {
        let adapter = InMemoryAdapter::new();
        adapter.put("a.b", &Value::from(true)).unwrap();
        assert_eq!(adapter.get("a.b").unwrap(), Some(Value::from(true)));
        assert_eq!(adapter.list("a.").unwrap().len(), 1);
    }
}
