//! Per-contact serialization of ledger writes.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockKey = (String, String);
type LockMap = DashMap<LockKey, Arc<Mutex<()>>>;

/// One async mutex per (tenant, contact). Payments of different contacts
/// never wait on each other. Entries live only while someone holds or waits
/// on them.
#[derive(Debug, Default)]
pub struct ContactLocks {
    locks: Arc<LockMap>,
}

/// Held for the duration of one contact's critical section.
#[derive(Debug)]
pub struct ContactGuard {
    guard: Option<OwnedMutexGuard<()>>,
    key: LockKey,
    locks: Arc<LockMap>,
}

impl Drop for ContactGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters hold their own clone of the mutex, so a count of one means
        // only the map still references it.
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

impl ContactLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, tenant_id: &str, contact_id: &str) -> ContactGuard {
        let key = (tenant_id.to_string(), contact_id.to_string());
        // Clone the Arc out so the map shard is not held across the await.
        let mutex = self.locks.entry(key.clone()).or_default().clone();
        let guard = mutex.lock_owned().await;
        ContactGuard {
            guard: Some(guard),
            key,
            locks: self.locks.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
