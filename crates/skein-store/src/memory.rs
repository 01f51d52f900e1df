//! In-memory record store backed by a concurrent map.

use crate::RecordStore;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use skein_types::records::RecordTags;
use skein_types::{SkeinError, SkeinResult};

#[derive(Clone)]
struct Stored {
    value: Value,
    tags: RecordTags,
}

/// Thread-safe in-memory store. Keyed by `(record_type, id)`.
#[derive(Default)]
pub struct MemoryStore {
    records: DashMap<(String, String), Stored>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn key(record_type: &str, id: &str) -> (String, String) {
        (record_type.to_string(), id.to_string())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn save(
        &self,
        record_type: &str,
        id: &str,
        value: Value,
        tags: RecordTags,
    ) -> SkeinResult<()> {
        let key = Self::key(record_type, id);
        match self.records.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(SkeinError::DuplicateRecord(format!("{record_type}/{id}")))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Stored { value, tags });
                Ok(())
            }
        }
    }

    async fn update(
        &self,
        record_type: &str,
        id: &str,
        value: Value,
        tags: RecordTags,
    ) -> SkeinResult<()> {
        let key = Self::key(record_type, id);
        match self.records.get_mut(&key) {
            Some(mut stored) => {
                *stored = Stored { value, tags };
                Ok(())
            }
            None => Err(SkeinError::RecordNotFound(format!("{record_type}/{id}"))),
        }
    }

    async fn find_by_id(&self, record_type: &str, id: &str) -> SkeinResult<Option<Value>> {
        Ok(self
            .records
            .get(&Self::key(record_type, id))
            .map(|stored| stored.value.clone()))
    }

    async fn find_by_query(
        &self,
        record_type: &str,
        filter: &RecordTags,
    ) -> SkeinResult<Vec<Value>> {
        let mut results = Vec::new();
        for entry in self.records.iter() {
            if entry.key().0 != record_type {
                continue;
            }
            let matches = filter
                .iter()
                .all(|(k, v)| entry.value().tags.get(k) == Some(v));
            if matches {
                results.push(entry.value().value.clone());
            }
        }
        Ok(results)
    }

    async fn delete(&self, record_type: &str, id: &str) -> SkeinResult<()> {
        self.records.remove(&Self::key(record_type, id));
        Ok(())
    }
}
