//! auth-coordinator - Token refresh coordination and resumable streams
//!
//! This crate provides the session layer of a protocol server:
//! - Session records with a token-fingerprint reverse index
//! - Per-stream bounded message history with monotonic cursors for resumption
//! - Expiring named locks, in-memory or in a shared store (Redis)
//! - A periodic refresh cycle run by at most one instance per time window
//! - OAuth 2.1 refresh-token exchange with change notifications

pub mod config;
pub mod coordination;
pub mod expiration;
pub mod lock;
pub mod notifications;
pub mod storage;
#[cfg(test)]
pub mod testutil;
pub mod tokens;

use std::sync::Arc;

use config::Config;
use coordination::RefreshScheduler;
use lock::LockBackend;
use notifications::BroadcastPublisher;
use storage::{MemorySessionStore, SessionStore};
use tokens::{RefreshExecutor, RefreshPolicy, TokenIssuer};

/// Buffered notifications per session channel before slow receivers lag
const NOTIFICATION_CHANNEL_CAPACITY: usize = 64;

/// Shared application state
pub struct AppState {
    pub config: Config,
    pub executor: Arc<RefreshExecutor>,
    pub lock: Arc<dyn LockBackend>,
    pub publisher: Arc<BroadcastPublisher>,
    pub store: Arc<dyn SessionStore>,
}

impl AppState {
    pub fn new(config: Config, lock: Arc<dyn LockBackend>, issuer: Arc<dyn TokenIssuer>) -> Self {
        let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new(&config.store));
        let publisher = Arc::new(BroadcastPublisher::new(NOTIFICATION_CHANNEL_CAPACITY));
        let executor = Arc::new(RefreshExecutor::new(
            Arc::clone(&store),
            issuer,
            publisher.clone(),
            RefreshPolicy::from(&config.refresh),
        ));

        Self {
            config,
            executor,
            lock,
            publisher,
            store,
        }
    }

    pub fn scheduler(&self) -> RefreshScheduler {
        RefreshScheduler::new(
            &self.config,
            Arc::clone(&self.lock),
            Arc::clone(&self.executor),
        )
    }
}
