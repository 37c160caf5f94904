use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{LockBackend, LockError};

#[derive(Debug, Clone)]
struct LockEntry {
    expires_at: Instant,
    holder_id: String,
}

impl LockEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Single-process lock table. Expired entries count as absent and are swept
/// on the next acquire.
#[derive(Debug, Default)]
pub struct MemoryLockBackend {
    locks: Mutex<HashMap<String, LockEntry>>,
}

impl MemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockBackend for MemoryLockBackend {
    async fn acquire(&self, key: &str, ttl: Duration, holder_id: &str) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut locks = self.locks.lock().await;
        locks.retain(|_, entry| entry.is_live(now));

        if locks.contains_key(key) {
            return Ok(false);
        }

        locks.insert(
            key.to_string(),
            LockEntry {
                expires_at: now + ttl,
                holder_id: holder_id.to_string(),
            },
        );
        tracing::trace!(key = %key, holder = %holder_id, "Lock acquired");
        Ok(true)
    }

    async fn release(&self, key: &str, holder_id: &str) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut locks = self.locks.lock().await;
        match locks.get(key) {
            Some(entry) if entry.is_live(now) && entry.holder_id == holder_id => {
                locks.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn extend(&self, key: &str, ttl: Duration, holder_id: &str) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut locks = self.locks.lock().await;
        match locks.get_mut(key) {
            Some(entry) if entry.is_live(now) && entry.holder_id == holder_id => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn is_locked(&self, key: &str) -> Result<Option<String>, LockError> {
        let now = Instant::now();
        let locks = self.locks.lock().await;
        Ok(locks
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.holder_id.clone()))
    }
}
