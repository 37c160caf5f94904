//! In-memory session store
//!
//! All state lives in one map guarded by a `tokio::sync::RwLock`. Mutations
//! take the write lock for their whole critical section, so cursor
//! assignment and fingerprint re-indexing are never observed half-done.
//! Nothing survives a restart.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::models::{AuthorizationContext, MessageEntry, Session, Stream, TokenRefreshInfo};
use super::store::{SessionStore, StoreError};
use crate::config::StoreConfig;

struct SessionRecord {
    session: Session,
    /// Session-level history for clients that never open a stream
    history: VecDeque<MessageEntry>,
    history_cursor: u64,
    stream_history: HashMap<String, VecDeque<MessageEntry>>,
}

impl SessionRecord {
    fn new(session: Session) -> Self {
        Self {
            session,
            history: VecDeque::new(),
            history_cursor: 0,
            stream_history: HashMap::new(),
        }
    }
}

#[derive(Default)]
struct Inner {
    /// Secondary index: token fingerprint -> session id
    by_token_hash: HashMap<String, String>,
    sessions: HashMap<String, SessionRecord>,
}

impl Inner {
    fn remove_session(&mut self, session_id: &str) -> bool {
        let Some(record) = self.sessions.remove(session_id) else {
            return false;
        };
        if let Some(hash) = record.session.token_hash() {
            unindex(&mut self.by_token_hash, hash, session_id);
        }
        true
    }

    /// Install new credentials and move the fingerprint mapping. With
    /// `expected_token_hash`, nothing changes unless the session still holds
    /// that fingerprint.
    fn replace_authorization(
        &mut self,
        session_id: &str,
        expected_token_hash: Option<&str>,
        authorization: AuthorizationContext,
        token_refresh: Option<TokenRefreshInfo>,
    ) -> Result<bool, StoreError> {
        let record = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;

        if let Some(expected) = expected_token_hash {
            if record.session.token_hash() != Some(expected) {
                return Ok(false);
            }
        }

        if let Some(old_hash) = record.session.token_hash() {
            unindex(&mut self.by_token_hash, old_hash, session_id);
        }
        self.by_token_hash
            .insert(authorization.token_hash.clone(), session_id.to_string());

        record.session.authorization = Some(authorization);
        record.session.token_refresh = token_refresh;
        record.session.last_activity = Utc::now();
        Ok(true)
    }
}

/// Drop a fingerprint mapping only while it still points at `session_id`.
fn unindex(index: &mut HashMap<String, String>, token_hash: &str, session_id: &str) {
    if index.get(token_hash).map(String::as_str) == Some(session_id) {
        index.remove(token_hash);
    }
}

fn push_bounded(history: &mut VecDeque<MessageEntry>, entry: MessageEntry, cap: usize) {
    history.push_back(entry);
    while history.len() > cap {
        history.pop_front();
    }
}

fn entries_after(history: &VecDeque<MessageEntry>, event_id: u64) -> Vec<MessageEntry> {
    match history.iter().position(|e| e.event_id == event_id) {
        Some(pos) => history.iter().skip(pos + 1).cloned().collect(),
        None => Vec::new(),
    }
}

pub struct MemorySessionStore {
    idle_timeout: Duration,
    inner: RwLock<Inner>,
    max_messages_per_stream: usize,
}

impl MemorySessionStore {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            idle_timeout: config.idle_timeout,
            inner: RwLock::new(Inner::default()),
            max_messages_per_stream: config.max_messages_per_stream.max(1),
        }
    }

    fn record_message(
        &self,
        record: &mut SessionRecord,
        stream_id: &str,
        event_id: Option<u64>,
        message: serde_json::Value,
    ) -> Result<u64, StoreError> {
        let now = Utc::now();
        let Some(stream) = record.session.streams.get_mut(stream_id) else {
            return Err(StoreError::StreamNotFound {
                session_id: record.session.id.clone(),
                stream_id: stream_id.to_string(),
            });
        };

        let event_id = event_id.unwrap_or(stream.event_id + 1);
        if event_id <= stream.event_id {
            return Err(StoreError::CursorRegression {
                given: event_id,
                last: stream.event_id,
                stream_id: stream_id.to_string(),
            });
        }

        stream.event_id = event_id;
        stream.last_event_id = Some(event_id.to_string());
        stream.last_activity = now;
        record.session.last_activity = now;

        let history = record
            .stream_history
            .entry(stream_id.to_string())
            .or_default();
        push_bounded(
            history,
            MessageEntry { event_id, message },
            self.max_messages_per_stream,
        );
        Ok(event_id)
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, mut session: Session) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.sessions.contains_key(&session.id) {
            return Err(StoreError::DuplicateSession(session.id));
        }

        session.streams.clear();
        if let Some(hash) = session.token_hash() {
            inner
                .by_token_hash
                .insert(hash.to_string(), session.id.clone());
        }
        tracing::debug!(session_id = %session.id, "Created session");
        inner
            .sessions
            .insert(session.id.clone(), SessionRecord::new(session));
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.sessions.get(session_id).map(|r| r.session.clone()))
    }

    async fn delete(&self, session_id: &str) -> Result<bool, StoreError> {
        let deleted = self.inner.write().await.remove_session(session_id);
        if deleted {
            tracing::debug!(session_id = %session_id, "Deleted session");
        }
        Ok(deleted)
    }

    async fn cleanup(&self) -> Result<usize, StoreError> {
        let idle = chrono::Duration::from_std(self.idle_timeout)
            .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        let cutoff = Utc::now() - idle;

        let mut inner = self.inner.write().await;
        let stale: Vec<String> = inner
            .sessions
            .values()
            .filter(|r| r.session.last_activity < cutoff)
            .map(|r| r.session.id.clone())
            .collect();

        let mut cleaned = 0;
        for id in stale {
            if inner.remove_session(&id) {
                cleaned += 1;
            }
        }

        if cleaned > 0 {
            tracing::info!(count = cleaned, "Cleaned up idle sessions");
        }
        Ok(cleaned)
    }

    async fn touch(&self, session_id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        match inner.sessions.get_mut(session_id) {
            Some(record) => {
                record.session.last_activity = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.inner.read().await.sessions.len())
    }

    async fn create_stream(
        &self,
        session_id: &str,
        stream_id: &str,
    ) -> Result<Option<Stream>, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(record) = inner.sessions.get_mut(session_id) else {
            return Ok(None);
        };

        let stream = Stream::new(stream_id);
        record.session.last_activity = stream.created_at;
        record
            .session
            .streams
            .insert(stream_id.to_string(), stream.clone());
        record.stream_history.remove(stream_id);
        tracing::debug!(session_id = %session_id, stream_id = %stream_id, "Created stream");
        Ok(Some(stream))
    }

    async fn get_stream(
        &self,
        session_id: &str,
        stream_id: &str,
    ) -> Result<Option<Stream>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .sessions
            .get(session_id)
            .and_then(|r| r.session.streams.get(stream_id))
            .cloned())
    }

    async fn delete_stream(&self, session_id: &str, stream_id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(record) = inner.sessions.get_mut(session_id) else {
            return Ok(false);
        };
        record.stream_history.remove(stream_id);
        Ok(record.session.streams.remove(stream_id).is_some())
    }

    async fn add_message(
        &self,
        session_id: &str,
        stream_id: &str,
        event_id: u64,
        message: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
        self.record_message(record, stream_id, Some(event_id), message)?;
        Ok(())
    }

    async fn append_message(
        &self,
        session_id: &str,
        stream_id: &str,
        message: serde_json::Value,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
        self.record_message(record, stream_id, None, message)
    }

    async fn get_messages_from(
        &self,
        session_id: &str,
        stream_id: &str,
        event_id: u64,
    ) -> Result<Vec<MessageEntry>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .sessions
            .get(session_id)
            .and_then(|r| r.stream_history.get(stream_id))
            .map(|history| entries_after(history, event_id))
            .unwrap_or_default())
    }

    async fn add_session_message(
        &self,
        session_id: &str,
        message: serde_json::Value,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;

        record.history_cursor += 1;
        let event_id = record.history_cursor;
        record.session.last_activity = Utc::now();
        push_bounded(
            &mut record.history,
            MessageEntry { event_id, message },
            self.max_messages_per_stream,
        );
        Ok(event_id)
    }

    async fn session_messages_from(
        &self,
        session_id: &str,
        event_id: u64,
    ) -> Result<Vec<MessageEntry>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .sessions
            .get(session_id)
            .map(|r| entries_after(&r.history, event_id))
            .unwrap_or_default())
    }

    async fn update_authorization(
        &self,
        session_id: &str,
        authorization: AuthorizationContext,
        token_refresh: Option<TokenRefreshInfo>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.replace_authorization(session_id, None, authorization, token_refresh)?;
        tracing::debug!(session_id = %session_id, "Updated session authorization");
        Ok(())
    }

    async fn swap_authorization(
        &self,
        session_id: &str,
        expected_token_hash: &str,
        authorization: AuthorizationContext,
        token_refresh: Option<TokenRefreshInfo>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let swapped = inner.replace_authorization(
            session_id,
            Some(expected_token_hash),
            authorization,
            token_refresh,
        )?;
        if swapped {
            tracing::debug!(session_id = %session_id, "Swapped session authorization");
        } else {
            tracing::debug!(session_id = %session_id, "Authorization changed underneath, swap skipped");
        }
        Ok(swapped)
    }

    async fn get_session_by_token_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<Session>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_token_hash
            .get(token_hash)
            .and_then(|id| inner.sessions.get(id))
            .map(|r| r.session.clone()))
    }

    async fn increment_refresh_attempts(&self, session_id: &str) -> Result<u32, StoreError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;

        Ok(match record.session.token_refresh.as_mut() {
            Some(info) => {
                info.refresh_attempts += 1;
                info.refresh_attempts
            }
            None => 0,
        })
    }

    async fn refresh_candidates(
        &self,
        deadline: DateTime<Utc>,
    ) -> Result<Vec<Session>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .sessions
            .values()
            .filter(|r| r.session.token_refresh.is_some())
            .filter(|r| {
                r.session
                    .authorization
                    .as_ref()
                    .is_some_and(|a| a.expires_at <= deadline)
            })
            .map(|r| r.session.clone())
            .collect())
    }
}
