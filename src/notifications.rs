//! Outbound notifications to session subscribers

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};

use crate::tokens::IssuedToken;

pub const TOKEN_REFRESHED_METHOD: &str = "notifications/token_refreshed";

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Delivery failed: {0}")]
    Delivery(String),
}

/// A JSON-RPC 2.0 notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification<P> {
    pub jsonrpc: String,
    pub method: String,
    pub params: P,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRefreshedParams {
    pub access_token: String,
    pub expires_in: u64,
    pub scope: Option<String>,
    pub token_type: String,
}

impl Notification<TokenRefreshedParams> {
    pub fn token_refreshed(token: &IssuedToken, expires_in: u64) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: TOKEN_REFRESHED_METHOD.to_string(),
            params: TokenRefreshedParams {
                access_token: token.access_token.clone(),
                expires_in,
                scope: token.scope.clone(),
                token_type: token.token_type.clone(),
            },
        }
    }
}

/// Delivers a message to whoever listens on a per-session channel.
#[async_trait]
pub trait NotificationPublisher: Send + Sync {
    /// Returns how many subscribers received the message.
    async fn publish(&self, channel: &str, message: serde_json::Value)
        -> Result<usize, PublishError>;
}

/// In-process publisher with one broadcast channel per session id.
pub struct BroadcastPublisher {
    capacity: usize,
    channels: RwLock<HashMap<String, broadcast::Sender<serde_json::Value>>>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: RwLock::new(HashMap::new()),
        }
    }

    pub async fn subscribe(&self, channel: &str) -> broadcast::Receiver<serde_json::Value> {
        let mut channels = self.channels.write().await;
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }
}

#[async_trait]
impl NotificationPublisher for BroadcastPublisher {
    async fn publish(
        &self,
        channel: &str,
        message: serde_json::Value,
    ) -> Result<usize, PublishError> {
        let mut channels = self.channels.write().await;
        let Some(sender) = channels.get(channel) else {
            tracing::debug!(channel = %channel, "No subscribers for notification");
            return Ok(0);
        };

        match sender.send(message) {
            Ok(delivered) => Ok(delivered),
            Err(_) => {
                // Every receiver is gone
                channels.remove(channel);
                Ok(0)
            }
        }
    }
}
