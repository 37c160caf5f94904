use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who a session's current access token was issued to, and for what.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationContext {
    pub audience: Vec<String>,
    pub client_id: String,
    /// When the access token stops being valid
    pub expires_at: DateTime<Utc>,
    /// Ordered, duplicate-free
    pub scopes: Vec<String>,
    pub subject_id: String,
    /// One-way hash of the bearer token; the raw token is never stored
    pub token_hash: String,
}

impl AuthorizationContext {
    pub fn new(
        subject_id: impl Into<String>,
        client_id: impl Into<String>,
        scopes: impl IntoIterator<Item = String>,
        audience: impl IntoIterator<Item = String>,
        token_hash: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            audience: dedup_preserving_order(audience),
            client_id: client_id.into(),
            expires_at,
            scopes: dedup_preserving_order(scopes),
            subject_id: subject_id.into(),
            token_hash: token_hash.into(),
        }
    }
}

/// What is needed to obtain a new access token for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRefreshInfo {
    pub authorization_server: String,
    pub client_id: String,
    pub last_refresh_at: Option<DateTime<Utc>>,
    pub refresh_attempts: u32,
    pub refresh_token: String,
    pub scopes: Vec<String>,
}

impl TokenRefreshInfo {
    pub fn new(
        refresh_token: impl Into<String>,
        client_id: impl Into<String>,
        authorization_server: impl Into<String>,
        scopes: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            authorization_server: authorization_server.into(),
            client_id: client_id.into(),
            last_refresh_at: None,
            refresh_attempts: 0,
            refresh_token: refresh_token.into(),
            scopes: dedup_preserving_order(scopes),
        }
    }
}

/// A resumable event stream within a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stream {
    pub created_at: DateTime<Utc>,
    /// Last cursor assigned on this stream; 0 before the first message
    pub event_id: u64,
    pub id: String,
    pub last_activity: DateTime<Utc>,
    pub last_event_id: Option<String>,
}

impl Stream {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            event_id: 0,
            id: id.into(),
            last_activity: now,
            last_event_id: None,
        }
    }
}

/// A client session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub authorization: Option<AuthorizationContext>,
    pub created_at: DateTime<Utc>,
    pub id: String,
    pub last_activity: DateTime<Utc>,
    pub streams: HashMap<String, Stream>,
    pub token_refresh: Option<TokenRefreshInfo>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            authorization: None,
            created_at: now,
            id: id.into(),
            last_activity: now,
            streams: HashMap::new(),
            token_refresh: None,
        }
    }

    pub fn with_authorization(
        mut self,
        authorization: AuthorizationContext,
        token_refresh: Option<TokenRefreshInfo>,
    ) -> Self {
        self.authorization = Some(authorization);
        self.token_refresh = token_refresh;
        self
    }

    pub fn token_hash(&self) -> Option<&str> {
        self.authorization.as_ref().map(|a| a.token_hash.as_str())
    }
}

/// One entry in a stream's replay history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEntry {
    pub event_id: u64,
    pub message: serde_json::Value,
}

fn dedup_preserving_order(items: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}
