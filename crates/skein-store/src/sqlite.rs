//! SQLite-backed record store.
//!
//! Records are stored as JSON blobs with their tags serialized alongside;
//! tag filters are evaluated after deserialization. Operations are short
//! and synchronous under a single connection mutex.

use crate::RecordStore;
use async_trait::async_trait;
use rusqlite::Connection;
use serde_json::Value;
use skein_types::records::RecordTags;
use skein_types::{SkeinError, SkeinResult};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Durable record store backed by SQLite.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> SkeinResult<Self> {
        let conn = Connection::open(path).map_err(|e| SkeinError::Storage(e.to_string()))?;
        Self::init(conn)
    }

    /// Open an in-memory database, useful for tests.
    pub fn open_in_memory() -> SkeinResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| SkeinError::Storage(e.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> SkeinResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS records (
                record_type TEXT NOT NULL,
                id          TEXT NOT NULL,
                value       TEXT NOT NULL,
                tags        TEXT NOT NULL,
                updated_at  TEXT NOT NULL,
                PRIMARY KEY (record_type, id)
            );
            CREATE INDEX IF NOT EXISTS idx_records_type ON records (record_type);",
        )
        .map_err(|e| SkeinError::Storage(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn save(
        &self,
        record_type: &str,
        id: &str,
        value: Value,
        tags: RecordTags,
    ) -> SkeinResult<()> {
        let conn = self.lock();
        let value_blob =
            serde_json::to_string(&value).map_err(|e| SkeinError::Storage(e.to_string()))?;
        let tags_blob =
            serde_json::to_string(&tags).map_err(|e| SkeinError::Storage(e.to_string()))?;
        let now = chrono_now();
        let result = conn.execute(
            "INSERT INTO records (record_type, id, value, tags, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![record_type, id, value_blob, tags_blob, now],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(SkeinError::DuplicateRecord(format!("{record_type}/{id}")))
            }
            Err(e) => Err(SkeinError::Storage(e.to_string())),
        }
    }

    async fn update(
        &self,
        record_type: &str,
        id: &str,
        value: Value,
        tags: RecordTags,
    ) -> SkeinResult<()> {
        let conn = self.lock();
        let value_blob =
            serde_json::to_string(&value).map_err(|e| SkeinError::Storage(e.to_string()))?;
        let tags_blob =
            serde_json::to_string(&tags).map_err(|e| SkeinError::Storage(e.to_string()))?;
        let now = chrono_now();
        let changed = conn
            .execute(
                "UPDATE records SET value = ?3, tags = ?4, updated_at = ?5
                 WHERE record_type = ?1 AND id = ?2",
                rusqlite::params![record_type, id, value_blob, tags_blob, now],
            )
            .map_err(|e| SkeinError::Storage(e.to_string()))?;
        if changed == 0 {
            return Err(SkeinError::RecordNotFound(format!("{record_type}/{id}")));
        }
        Ok(())
    }

    async fn find_by_id(&self, record_type: &str, id: &str) -> SkeinResult<Option<Value>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT value FROM records WHERE record_type = ?1 AND id = ?2")
            .map_err(|e| SkeinError::Storage(e.to_string()))?;
        let result = stmt.query_row(rusqlite::params![record_type, id], |row| {
            let blob: String = row.get(0)?;
            Ok(blob)
        });
        match result {
            Ok(blob) => {
                let value =
                    serde_json::from_str(&blob).map_err(|e| SkeinError::Storage(e.to_string()))?;
                Ok(Some(value))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(SkeinError::Storage(e.to_string())),
        }
    }

    async fn find_by_query(
        &self,
        record_type: &str,
        filter: &RecordTags,
    ) -> SkeinResult<Vec<Value>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT value, tags FROM records WHERE record_type = ?1 ORDER BY updated_at")
            .map_err(|e| SkeinError::Storage(e.to_string()))?;
        let rows = stmt
            .query_map(rusqlite::params![record_type], |row| {
                let value: String = row.get(0)?;
                let tags: String = row.get(1)?;
                Ok((value, tags))
            })
            .map_err(|e| SkeinError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        for row in rows {
            let (value_blob, tags_blob) = row.map_err(|e| SkeinError::Storage(e.to_string()))?;
            let tags: RecordTags = serde_json::from_str(&tags_blob)
                .map_err(|e| SkeinError::Storage(e.to_string()))?;
            let matches = filter.iter().all(|(k, v)| tags.get(k) == Some(v));
            if matches {
                let value = serde_json::from_str(&value_blob)
                    .map_err(|e| SkeinError::Storage(e.to_string()))?;
                results.push(value);
            }
        }
        Ok(results)
    }

    async fn delete(&self, record_type: &str, id: &str) -> SkeinResult<()> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM records WHERE record_type = ?1 AND id = ?2",
            rusqlite::params![record_type, id],
        )
        .map_err(|e| SkeinError::Storage(e.to_string()))?;
        Ok(())
    }
}

fn chrono_now() -> String {
    // RFC 3339 sorts lexicographically, which keeps ORDER BY updated_at stable.
    chrono::Utc::now().to_rfc3339()
}
