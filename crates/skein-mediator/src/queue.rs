//! Durable per-recipient-key message queue.
//!
//! All queue operations for one recipient key serialize on a key lock,
//! independent of the protocol thread locks: a forward and a pickup for
//! the same key never interleave. Ordering within a key is arrival
//! order, with a process-local sequence number breaking timestamp ties.

use chrono::Utc;
use skein_engine::ThreadLocks;
use skein_store::{RecordStore, RecordStoreExt};
use skein_types::records::{BaseRecord, QueuedMessage, RecordTags};
use skein_types::SkeinResult;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Store-and-forward queue over the record store.
pub struct RoutingQueue {
    store: Arc<dyn RecordStore>,
    locks: ThreadLocks,
    seq: AtomicU64,
}

impl RoutingQueue {
    /// Build a queue over the shared store. The key locks are private to
    /// the queue.
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            locks: ThreadLocks::new(),
            seq: AtomicU64::new(0),
        }
    }

    fn lock_key(recipient_key: &str) -> String {
        format!("routing/{recipient_key}")
    }

    fn filter(recipient_key: &str) -> RecordTags {
        let mut filter = RecordTags::new();
        filter.insert("recipient_key".into(), recipient_key.to_string());
        filter
    }

    /// Append a packed payload to a recipient's queue.
    pub async fn enqueue(
        &self,
        recipient_key: &str,
        encrypted_payload: Vec<u8>,
    ) -> SkeinResult<QueuedMessage> {
        let _guard = self.locks.acquire(&Self::lock_key(recipient_key)).await;
        let message = QueuedMessage {
            id: Uuid::new_v4().to_string(),
            recipient_key: recipient_key.to_string(),
            encrypted_payload,
            received_at: Utc::now(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };
        self.store.save_record(&message).await?;
        debug!(recipient_key, message_id = %message.id, "message queued");
        Ok(message)
    }

    /// The oldest messages queued for a key, up to `limit`. Does not
    /// remove anything; a repeated pickup returns the same messages
    /// until they are acknowledged.
    pub async fn pickup(&self, recipient_key: &str, limit: usize) -> SkeinResult<Vec<QueuedMessage>> {
        let _guard = self.locks.acquire(&Self::lock_key(recipient_key)).await;
        let mut messages: Vec<QueuedMessage> =
            self.store.query_records(&Self::filter(recipient_key)).await?;
        messages.sort_by(|a, b| (a.received_at, a.seq).cmp(&(b.received_at, b.seq)));
        messages.truncate(limit);
        Ok(messages)
    }

    /// Remove acknowledged messages from a key's queue. Ids that are
    /// unknown or queued under a different key are skipped. Returns how
    /// many messages were removed.
    pub async fn acknowledge(&self, recipient_key: &str, ids: &[String]) -> SkeinResult<usize> {
        let _guard = self.locks.acquire(&Self::lock_key(recipient_key)).await;
        let mut removed = 0;
        for id in ids {
            let Some(message) = self.store.get_record::<QueuedMessage>(id).await? else {
                continue;
            };
            if message.recipient_key != recipient_key {
                continue;
            }
            self.store.delete(QueuedMessage::RECORD_TYPE, id).await?;
            removed += 1;
        }
        debug!(recipient_key, removed, "queue acknowledgment applied");
        Ok(removed)
    }

    /// How many messages are queued for a key.
    pub async fn count(&self, recipient_key: &str) -> SkeinResult<usize> {
        let _guard = self.locks.acquire(&Self::lock_key(recipient_key)).await;
        Ok(self
            .store
            .query_records::<QueuedMessage>(&Self::filter(recipient_key))
            .await?
            .len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_store::MemoryStore;

    fn queue() -> RoutingQueue {
        RoutingQueue::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_pickup_is_oldest_first_and_non_destructive() {
        let queue = queue();
        let first = queue.enqueue("key-a", b"one".to_vec()).await.unwrap();
        let second = queue.enqueue("key-a", b"two".to_vec()).await.unwrap();
        queue.enqueue("key-b", b"elsewhere".to_vec()).await.unwrap();

        let batch = queue.pickup("key-a", 10).await.unwrap();
        assert_eq!(
            batch.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
            vec![first.id.as_str(), second.id.as_str()]
        );

        // Nothing was removed.
        let again = queue.pickup("key-a", 10).await.unwrap();
        assert_eq!(again.len(), 2);
        assert_eq!(queue.count("key-a").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_pickup_honors_limit() {
        let queue = queue();
        for i in 0..5u8 {
            queue.enqueue("key-a", vec![i]).await.unwrap();
        }
        let batch = queue.pickup("key-a", 3).await.unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].encrypted_payload, vec![0]);
    }

    #[tokio::test]
    async fn test_acknowledge_removes_only_named_ids() {
        let queue = queue();
        let first = queue.enqueue("key-a", b"one".to_vec()).await.unwrap();
        let second = queue.enqueue("key-a", b"two".to_vec()).await.unwrap();

        let removed = queue
            .acknowledge("key-a", &[first.id.clone(), "no-such-id".into()])
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let remaining = queue.pickup("key-a", 10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, second.id);
    }

    #[tokio::test]
    async fn test_acknowledge_ignores_foreign_keys() {
        let queue = queue();
        let message = queue.enqueue("key-a", b"one".to_vec()).await.unwrap();
        let removed = queue.acknowledge("key-b", &[message.id]).await.unwrap();
        assert_eq!(removed, 0);
        assert_eq!(queue.count("key-a").await.unwrap(), 1);
    }
}
