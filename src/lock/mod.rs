//! Expiring named locks shared by cooperating instances
//!
//! A lock is a `(key, holder, expiry)` triple. Only the holder may release or
//! extend it, and the TTL is the sole recovery mechanism: a crashed holder's
//! lock simply runs out. Two backends implement the same contract:
//!
//! - [`MemoryLockBackend`] for a single process
//! - [`SharedLockBackend`] over any [`AtomicStore`] (Redis with the `redis`
//!   feature), for instances in different processes

mod memory;
#[cfg(feature = "redis")]
mod redis_store;
mod shared;

pub use memory::MemoryLockBackend;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;
pub use shared::{AtomicStore, SharedLockBackend};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::LockConfig;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Lock backend unavailable: {0}")]
    Backend(String),
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Take `key` for `holder_id` unless someone else holds it. Contention is
    /// `Ok(false)`, never an error.
    async fn acquire(&self, key: &str, ttl: Duration, holder_id: &str) -> Result<bool, LockError>;

    /// Remove `key` only if `holder_id` holds it.
    async fn release(&self, key: &str, holder_id: &str) -> Result<bool, LockError>;

    /// Reset the expiry of `key` only if `holder_id` holds it.
    async fn extend(&self, key: &str, ttl: Duration, holder_id: &str) -> Result<bool, LockError>;

    /// Current holder of `key`. For diagnostics only; decisions go through
    /// [`acquire`](LockBackend::acquire).
    async fn is_locked(&self, key: &str) -> Result<Option<String>, LockError>;

    /// Release backend resources (connections and the like).
    async fn close(&self) -> Result<(), LockError> {
        Ok(())
    }
}

/// Build the lock backend: shared when a store handle is given, in-memory
/// otherwise.
pub fn lock_backend(shared: Option<Arc<dyn AtomicStore>>) -> Arc<dyn LockBackend> {
    match shared {
        Some(store) => Arc::new(SharedLockBackend::new(store)),
        None => Arc::new(MemoryLockBackend::new()),
    }
}

/// Connect the backend named by configuration: Redis when `redis_url` is set,
/// in-memory otherwise.
pub async fn connect_lock_backend(config: &LockConfig) -> Result<Arc<dyn LockBackend>, LockError> {
    match config.redis_url.as_deref() {
        #[cfg(feature = "redis")]
        Some(url) => {
            let store = RedisStore::connect(url).await?;
            Ok(lock_backend(Some(Arc::new(store))))
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => {
            tracing::warn!("REDIS_URL is set but the redis feature is disabled; using in-memory locks");
            Ok(lock_backend(None))
        }
        None => Ok(lock_backend(None)),
    }
}

/// `{namespace}:{key}`
pub fn lock_key(namespace: &str, key: impl std::fmt::Display) -> String {
    format!("{namespace}:{key}")
}
