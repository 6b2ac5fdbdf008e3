//! Per-item lock table
//!
//! Locks are created on first use and removed once no task holds or waits
//! on them, so the table only grows with the number of busy items.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::{Result, SyncError};

type LockTable = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

#[derive(Clone, Default)]
pub struct ItemLocks {
    table: LockTable,
}

/// Exclusive hold on one item; released on drop
pub struct ItemLockGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    table: LockTable,
}

impl ItemLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait up to `timeout` for exclusive access to `key`
    pub async fn acquire(&self, key: &str, timeout: Duration) -> Result<ItemLockGuard> {
        let lock = {
            let mut table = self.table.lock();
            table
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };

        let acquired = tokio::time::timeout(timeout, lock.lock_owned()).await;
        match acquired {
            Ok(guard) => Ok(ItemLockGuard {
                key: key.to_string(),
                guard: Some(guard),
                table: self.table.clone(),
            }),
            Err(_) => {
                evict_if_idle(&self.table, key);
                tracing::warn!(item = %key, timeout_ms = timeout.as_millis() as u64, "Timed out waiting for item lock");
                Err(SyncError::LockTimeout(key.to_string()))
            }
        }
    }

    /// Number of items with a live lock
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for ItemLockGuard {
    fn drop(&mut self) {
        // Release before checking, so our own Arc is the only one left
        if let Some(guard) = self.guard.take() {
            drop(guard);
        }
        evict_if_idle(&self.table, &self.key);
    }
}

/// Remove the entry when only the table still references it.
///
/// Waiters clone the Arc under the table lock, so a count of one seen under
/// that lock means nobody holds or awaits this item.
fn evict_if_idle(table: &LockTable, key: &str) {
    let mut table = table.lock();
    let idle = table
        .get(key)
        .map_or(false, |lock| Arc::strong_count(lock) == 1);
    if idle {
        table.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_locks_are_evicted_when_idle() {
        let locks = ItemLocks::new();
        {
            let _guard = locks.acquire("doc-1", Duration::from_secs(1)).await.unwrap();
            assert_eq!(locks.len(), 1);
        }
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_second_acquire_times_out() {
        let locks = ItemLocks::new();
        let _held = locks.acquire("doc-1", Duration::from_secs(1)).await.unwrap();

        let err = locks
            .acquire("doc-1", Duration::from_millis(20))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SyncError::LockTimeout(ref key) if key == "doc-1"));

        // Different items do not contend
        let _other = locks.acquire("doc-2", Duration::from_millis(20)).await.unwrap();
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let locks = ItemLocks::new();
        let held = locks.acquire("doc-1", Duration::from_secs(1)).await.unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                locks.acquire("doc-1", Duration::from_secs(5)).await.map(|_| ())
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        assert!(waiter.await.unwrap().is_ok());
        assert!(locks.is_empty());
    }
}
