//! Shared test helpers for the crate's `#[cfg(test)]` modules

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::config::{Config, InstanceConfig, LockConfig, RefreshConfig, StoreConfig};
use crate::notifications::{NotificationPublisher, PublishError};
use crate::storage::models::{AuthorizationContext, Session, TokenRefreshInfo};
use crate::storage::MemorySessionStore;
use crate::tokens::{fingerprint, IssuedToken, IssuerError, RefreshRequest, TokenIssuer};

/// A `Config` with every default, for a single test instance.
pub fn test_config() -> Config {
    Config {
        instance: InstanceConfig {
            id: "test-instance".to_string(),
        },
        lock: LockConfig::default(),
        refresh: RefreshConfig::default(),
        store: StoreConfig::default(),
    }
}

pub fn setup_store() -> MemorySessionStore {
    MemorySessionStore::new(&StoreConfig::default())
}

pub fn make_session(id: &str) -> Session {
    Session::new(id)
}

/// Authorization whose fingerprint is `token_hash`, expiring in
/// `expires_in_minutes`.
pub fn make_authorization(token_hash: &str, expires_in_minutes: i64) -> AuthorizationContext {
    AuthorizationContext::new(
        "user-123",
        "client-1",
        vec!["read".to_string(), "write".to_string()],
        vec!["https://api.example.com".to_string()],
        token_hash,
        Utc::now() + chrono::Duration::minutes(expires_in_minutes),
    )
}

/// A session holding `access_token` (by fingerprint) and `refresh_token`.
pub fn make_refreshable_session(
    id: &str,
    access_token: &str,
    refresh_token: &str,
    expires_in_minutes: i64,
) -> Session {
    Session::new(id).with_authorization(
        make_authorization(&fingerprint(access_token), expires_in_minutes),
        Some(TokenRefreshInfo::new(
            refresh_token,
            "client-1",
            "https://auth.example.com",
            vec!["read".to_string(), "write".to_string()],
        )),
    )
}

/// Token authority that issues `at-N`/`rt-N` for the N-th successful
/// refresh and rejects the listed refresh tokens.
#[derive(Default)]
pub struct FakeIssuer {
    calls: AtomicUsize,
    delay: Option<Duration>,
    issued: AtomicUsize,
    rejected: HashSet<String>,
}

impl FakeIssuer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_for(refresh_tokens: &[&str]) -> Self {
        Self {
            rejected: refresh_tokens.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }

    /// Each refresh takes `delay` before answering.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Same issuer, answering only after `delay`.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenIssuer for FakeIssuer {
    async fn refresh(&self, request: &RefreshRequest) -> Result<IssuedToken, IssuerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.rejected.contains(&request.refresh_token) {
            return Err(IssuerError::Rejected {
                body: r#"{"error":"invalid_grant"}"#.to_string(),
                status: 400,
            });
        }

        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(IssuedToken {
            access_token: format!("at-{n}"),
            expires_in: Some(3600),
            refresh_token: Some(format!("rt-{n}")),
            scope: Some(request.scopes.join(" ")),
            token_type: "Bearer".to_string(),
        })
    }
}

/// Keeps every published `(channel, message)` pair.
#[derive(Default)]
pub struct RecordingPublisher {
    messages: Mutex<Vec<(String, serde_json::Value)>>,
}

impl RecordingPublisher {
    pub fn messages(&self) -> Vec<(String, serde_json::Value)> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationPublisher for RecordingPublisher {
    async fn publish(
        &self,
        channel: &str,
        message: serde_json::Value,
    ) -> Result<usize, PublishError> {
        self.messages
            .lock()
            .unwrap()
            .push((channel.to_string(), message));
        Ok(1)
    }
}
