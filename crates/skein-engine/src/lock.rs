//! Per-thread record locks.
//!
//! All transitions touching the same `(protocol, thread_id)` are
//! serialized through one async mutex. The lock map is shared by every
//! protocol's state machine; keys for different threads never contend.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A map of per-key async mutexes.
///
/// Guards release on drop, so a failed transition can never leave its
/// lock held.
#[derive(Default)]
pub struct ThreadLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ThreadLocks {
    /// Create an empty lock map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`, waiting until the previous holder
    /// releases. Tasks acquire in FIFO order per key.
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let entry = self.locks.entry(key.to_string()).or_default();
            Arc::clone(entry.value())
        };
        lock.lock_owned().await
    }

    /// Number of keys ever locked, for introspection.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no key has been locked yet.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_serializes() {
        let locks = Arc::new(ThreadLocks::new());
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let running = running.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("connections/t-1").await;
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_contend() {
        let locks = Arc::new(ThreadLocks::new());
        let guard_a = locks.acquire("connections/t-1").await;
        // A different key can be acquired while t-1 is held.
        let guard_b = tokio::time::timeout(
            Duration::from_millis(100),
            locks.acquire("connections/t-2"),
        )
        .await
        .expect("unrelated key must not block");
        drop(guard_a);
        drop(guard_b);
    }

    #[tokio::test]
    async fn test_guard_drop_releases() {
        let locks = ThreadLocks::new();
        {
            let _guard = locks.acquire("k").await;
        }
        // Reacquire immediately after drop.
        let _guard = tokio::time::timeout(Duration::from_millis(100), locks.acquire("k"))
            .await
            .expect("lock must be free after guard drop");
    }
}
