//! Record storage for the Skein protocol engine.
//!
//! The engine talks to a generic [`RecordStore`] keyed by record type and
//! id, with derived tags as the query surface. Two implementations ship:
//! an in-memory store for tests and embedded use, and a SQLite store for
//! durable deployments.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use serde_json::Value;
use skein_types::records::{BaseRecord, RecordTags, TAG_THREAD_ID};
use skein_types::{SkeinError, SkeinResult};

/// Generic record persistence.
///
/// Implementations must make a saved record visible to queries only once
/// the save has durably completed, and must treat `save` of an existing
/// id as an error (`update` is the mutation path).
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Persist a new record. Fails with [`SkeinError::DuplicateRecord`]
    /// if the id already exists within the record type.
    async fn save(
        &self,
        record_type: &str,
        id: &str,
        value: Value,
        tags: RecordTags,
    ) -> SkeinResult<()>;

    /// Overwrite an existing record and its tags. Fails with
    /// [`SkeinError::RecordNotFound`] if the id is unknown.
    async fn update(
        &self,
        record_type: &str,
        id: &str,
        value: Value,
        tags: RecordTags,
    ) -> SkeinResult<()>;

    /// Fetch a record by id.
    async fn find_by_id(&self, record_type: &str, id: &str) -> SkeinResult<Option<Value>>;

    /// Fetch all records whose tags contain every entry of `filter`.
    async fn find_by_query(&self, record_type: &str, filter: &RecordTags)
        -> SkeinResult<Vec<Value>>;

    /// Remove a record. Removing an unknown id is a no-op.
    async fn delete(&self, record_type: &str, id: &str) -> SkeinResult<()>;
}

/// Typed convenience layer over [`RecordStore`].
#[async_trait]
pub trait RecordStoreExt: RecordStore {
    /// Persist a new typed record.
    async fn save_record<R: BaseRecord>(&self, record: &R) -> SkeinResult<()> {
        let value = serde_json::to_value(record)
            .map_err(|e| SkeinError::Storage(e.to_string()))?;
        self.save(R::RECORD_TYPE, record.id(), value, record.tags())
            .await
    }

    /// Overwrite an existing typed record.
    async fn update_record<R: BaseRecord>(&self, record: &R) -> SkeinResult<()> {
        let value = serde_json::to_value(record)
            .map_err(|e| SkeinError::Storage(e.to_string()))?;
        self.update(R::RECORD_TYPE, record.id(), value, record.tags())
            .await
    }

    /// Fetch a typed record by id.
    async fn get_record<R: BaseRecord>(&self, id: &str) -> SkeinResult<Option<R>> {
        match self.find_by_id(R::RECORD_TYPE, id).await? {
            Some(value) => {
                let record = serde_json::from_value(value)
                    .map_err(|e| SkeinError::Storage(e.to_string()))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Fetch all typed records matching a tag filter.
    async fn query_records<R: BaseRecord>(&self, filter: &RecordTags) -> SkeinResult<Vec<R>> {
        let values = self.find_by_query(R::RECORD_TYPE, filter).await?;
        values
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(|e| SkeinError::Storage(e.to_string())))
            .collect()
    }

    /// Locate the single live record for a thread, if any.
    async fn find_by_thread<R: BaseRecord>(&self, thread_id: &str) -> SkeinResult<Option<R>> {
        let mut filter = RecordTags::new();
        filter.insert(TAG_THREAD_ID.into(), thread_id.into());
        let mut records = self.query_records::<R>(&filter).await?;
        Ok(records.pop())
    }
}

impl<T: RecordStore + ?Sized> RecordStoreExt for T {}
