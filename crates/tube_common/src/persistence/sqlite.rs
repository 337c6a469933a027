//! Structured tier - SQLite snapshots plus the remote replay queue.
//!
//! Schema:
//! - snapshots: latest snapshot per user
//! - replay_queue: snapshots whose remote write failed, keyed `{user}_{ts}`

use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

use super::durable::{replay_id, DurableStore, QueuedSnapshot, ReplayQueue};
use crate::error::Result;
use crate::types::{now_millis, StorageTier, SyncRecord};

pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open or create the database file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let store = Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        };
        store.initialize_schema()?;
        info!("Opened structured store at {}", path.display());
        Ok(store)
    }

    /// In-memory database (tests)
    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            path: None,
        };
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn initialize_schema(&self) -> Result<()> {
        self.conn().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS snapshots (
                user_id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                last_updated INTEGER NOT NULL,
                origin_tier TEXT NOT NULL,
                written_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS replay_queue (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                record TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                queued_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_replay_user_ts ON replay_queue(user_id, timestamp);
            "#,
        )?;
        Ok(())
    }
}

impl DurableStore for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn tier(&self) -> StorageTier {
        StorageTier::Structured
    }

    fn get(&self, user_id: &str) -> Result<Option<SyncRecord>> {
        let row: Option<(String, String)> = self
            .conn()
            .query_row(
                "SELECT state, origin_tier FROM snapshots WHERE user_id = ?1",
                params![user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            Some((state_json, origin)) => {
                let state = serde_json::from_str(&state_json)?;
                let origin_tier = serde_json::from_value(serde_json::Value::String(origin))
                    .unwrap_or(StorageTier::Structured);
                let mut record = SyncRecord::new(&state, origin_tier);
                record.user_id = user_id.to_string();
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn put(&self, record: &SyncRecord) -> Result<()> {
        let state_json = serde_json::to_string(&record.state)?;
        self.conn().execute(
            "INSERT INTO snapshots (user_id, state, last_updated, origin_tier, written_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_id) DO UPDATE SET
                state = excluded.state,
                last_updated = excluded.last_updated,
                origin_tier = excluded.origin_tier,
                written_at = excluded.written_at",
            params![
                &record.user_id,
                state_json,
                record.state.last_updated,
                record.origin_tier.to_string(),
                now_millis()
            ],
        )?;
        Ok(())
    }
}

impl ReplayQueue for SqliteStore {
    fn enqueue(&self, record: &SyncRecord) -> Result<String> {
        let id = replay_id(record);
        let json = serde_json::to_string(record)?;
        self.conn().execute(
            "INSERT OR REPLACE INTO replay_queue (id, user_id, record, timestamp, queued_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![&id, &record.user_id, json, record.timestamp, now_millis()],
        )?;
        debug!(replay_id = %id, "Queued snapshot for replay");
        Ok(id)
    }

    fn pending(&self, user_id: &str) -> Result<Vec<QueuedSnapshot>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, record, queued_at FROM replay_queue
             WHERE user_id = ?1 ORDER BY timestamp ASC",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut queued = Vec::new();
        for row in rows {
            let (id, json, queued_at) = row?;
            queued.push(QueuedSnapshot {
                id,
                record: serde_json::from_str(&json)?,
                queued_at,
            });
        }
        Ok(queued)
    }

    fn remove(&self, id: &str) -> Result<()> {
        self.conn()
            .execute("DELETE FROM replay_queue WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn remove_through(&self, user_id: &str, timestamp: i64) -> Result<usize> {
        let removed = self.conn().execute(
            "DELETE FROM replay_queue WHERE user_id = ?1 AND timestamp <= ?2",
            params![user_id, timestamp],
        )?;
        Ok(removed)
    }

    fn count(&self, user_id: &str) -> Result<usize> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM replay_queue WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LearningState;

    fn record(user: &str, ts: i64) -> SyncRecord {
        let mut state = LearningState::with_threads(user, &["t1".to_string()], 2, 3);
        state.last_updated = ts;
        SyncRecord::new(&state, StorageTier::Memory)
    }

    #[test]
    fn test_snapshot_upsert_keeps_latest_write() {
        let db = SqliteStore::open_in_memory().unwrap();
        db.put(&record("u1", 10)).unwrap();
        db.put(&record("u1", 20)).unwrap();
        let loaded = db.get("u1").unwrap().unwrap();
        assert_eq!(loaded.state.last_updated, 20);
        assert_eq!(loaded.origin_tier, StorageTier::Memory);
    }

    #[test]
    fn test_replay_queue_order_and_removal() {
        let db = SqliteStore::open_in_memory().unwrap();
        db.enqueue(&record("u1", 30)).unwrap();
        db.enqueue(&record("u1", 10)).unwrap();
        db.enqueue(&record("u2", 5)).unwrap();

        let pending = db.pending("u1").unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, "u1_10");
        assert_eq!(pending[1].id, "u1_30");

        assert_eq!(db.remove_through("u1", 10).unwrap(), 1);
        assert_eq!(db.count("u1").unwrap(), 1);
        assert_eq!(db.count("u2").unwrap(), 1);
    }

    #[test]
    fn test_enqueue_same_snapshot_twice_is_one_entry() {
        let db = SqliteStore::open_in_memory().unwrap();
        db.enqueue(&record("u1", 10)).unwrap();
        db.enqueue(&record("u1", 10)).unwrap();
        assert_eq!(db.count("u1").unwrap(), 1);
    }

    #[test]
    fn test_file_backed_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tube.db");
        {
            let db = SqliteStore::open(&path).unwrap();
            db.put(&record("u1", 99)).unwrap();
        }
        let db = SqliteStore::open(&path).unwrap();
        assert_eq!(db.get("u1").unwrap().unwrap().timestamp, 99);
    }
}
