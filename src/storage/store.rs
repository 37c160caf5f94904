use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use super::models::{AuthorizationContext, MessageEntry, Session, Stream, TokenRefreshInfo};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Cursor {given} is not after the last cursor {last} on stream {stream_id}")]
    CursorRegression {
        given: u64,
        last: u64,
        stream_id: String,
    },
    #[error("Session already exists: {0}")]
    DuplicateSession(String),
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("Stream {stream_id} not found in session {session_id}")]
    StreamNotFound {
        session_id: String,
        stream_id: String,
    },
}

/// Session records, per-stream replay history and the token fingerprint index.
///
/// Every read returns an owned copy; mutating it never touches stored state.
/// Backends must keep two invariants with their own atomic operations: one
/// live fingerprint mapping per session, and strictly increasing cursors per
/// stream.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new session. Its stream table and histories start empty.
    ///
    /// Fails with [`StoreError::DuplicateSession`] if the id is taken.
    async fn create(&self, session: Session) -> Result<(), StoreError>;

    async fn get(&self, session_id: &str) -> Result<Option<Session>, StoreError>;

    /// Remove a session with all its histories and its fingerprint mapping.
    /// Returns whether anything was removed; deleting twice is fine.
    async fn delete(&self, session_id: &str) -> Result<bool, StoreError>;

    /// Delete sessions idle for longer than the configured window.
    async fn cleanup(&self) -> Result<usize, StoreError>;

    /// Refresh a session's last-activity time.
    async fn touch(&self, session_id: &str) -> Result<bool, StoreError>;

    async fn len(&self) -> Result<usize, StoreError>;

    /// Install a fresh stream (cursor 0, empty history), replacing any stream
    /// with the same id. `None` if the session does not exist.
    async fn create_stream(
        &self,
        session_id: &str,
        stream_id: &str,
    ) -> Result<Option<Stream>, StoreError>;

    async fn get_stream(
        &self,
        session_id: &str,
        stream_id: &str,
    ) -> Result<Option<Stream>, StoreError>;

    async fn delete_stream(&self, session_id: &str, stream_id: &str) -> Result<bool, StoreError>;

    /// Record `message` at `event_id`, which must be greater than the
    /// stream's last cursor.
    async fn add_message(
        &self,
        session_id: &str,
        stream_id: &str,
        event_id: u64,
        message: serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Record `message` at the stream's next cursor and return that cursor.
    async fn append_message(
        &self,
        session_id: &str,
        stream_id: &str,
        message: serde_json::Value,
    ) -> Result<u64, StoreError>;

    /// Entries strictly after `event_id`, oldest first. Empty when the
    /// cursor is not in the retained history.
    async fn get_messages_from(
        &self,
        session_id: &str,
        stream_id: &str,
        event_id: u64,
    ) -> Result<Vec<MessageEntry>, StoreError>;

    /// Append to the session-level history used by clients without streams.
    async fn add_session_message(
        &self,
        session_id: &str,
        message: serde_json::Value,
    ) -> Result<u64, StoreError>;

    async fn session_messages_from(
        &self,
        session_id: &str,
        event_id: u64,
    ) -> Result<Vec<MessageEntry>, StoreError>;

    /// Replace a session's authorization and refresh info, moving its
    /// fingerprint mapping in the same step.
    async fn update_authorization(
        &self,
        session_id: &str,
        authorization: AuthorizationContext,
        token_refresh: Option<TokenRefreshInfo>,
    ) -> Result<(), StoreError>;

    /// Like [`update_authorization`](SessionStore::update_authorization), but
    /// only while the session still holds `expected_token_hash`. `Ok(false)`
    /// means another writer changed the credentials first and nothing was
    /// applied.
    async fn swap_authorization(
        &self,
        session_id: &str,
        expected_token_hash: &str,
        authorization: AuthorizationContext,
        token_refresh: Option<TokenRefreshInfo>,
    ) -> Result<bool, StoreError>;

    async fn get_session_by_token_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<Session>, StoreError>;

    /// Bump the refresh attempt counter in place, returning the new value.
    async fn increment_refresh_attempts(&self, session_id: &str) -> Result<u32, StoreError>;

    /// Sessions with refresh info whose access token expires at or before
    /// `deadline`.
    async fn refresh_candidates(
        &self,
        deadline: DateTime<Utc>,
    ) -> Result<Vec<Session>, StoreError>;
}
