use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{LockBackend, LockError};

/// The atomic primitives a shared key-value store must offer for locking.
///
/// Each operation must be a single atomic step in the store itself, e.g.
/// `SET key value NX PX ttl` for [`set_if_absent`](AtomicStore::set_if_absent)
/// and a server-side compare script for the `*_if_equals` operations.
#[async_trait]
pub trait AtomicStore: Send + Sync {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, LockError>;

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, LockError>;

    async fn expire_if_equals(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, LockError>;

    async fn get(&self, key: &str) -> Result<Option<String>, LockError>;

    async fn close(&self) -> Result<(), LockError> {
        Ok(())
    }
}

/// Cross-process locks kept in a shared store. The stored value is the
/// holder id, so ownership checks happen inside the store's atomic compare.
pub struct SharedLockBackend {
    store: Arc<dyn AtomicStore>,
}

impl SharedLockBackend {
    pub fn new(store: Arc<dyn AtomicStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl LockBackend for SharedLockBackend {
    async fn acquire(&self, key: &str, ttl: Duration, holder_id: &str) -> Result<bool, LockError> {
        let acquired = self.store.set_if_absent(key, holder_id, ttl).await?;
        if acquired {
            tracing::trace!(key = %key, holder = %holder_id, "Shared lock acquired");
        }
        Ok(acquired)
    }

    async fn release(&self, key: &str, holder_id: &str) -> Result<bool, LockError> {
        self.store.delete_if_equals(key, holder_id).await
    }

    async fn extend(&self, key: &str, ttl: Duration, holder_id: &str) -> Result<bool, LockError> {
        self.store.expire_if_equals(key, holder_id, ttl).await
    }

    async fn is_locked(&self, key: &str) -> Result<Option<String>, LockError> {
        self.store.get(key).await
    }

    async fn close(&self) -> Result<(), LockError> {
        self.store.close().await
    }
}
