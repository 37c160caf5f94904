//! The authority that exchanges refresh tokens for new access tokens

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifetime assumed when the authority omits `expires_in`
pub const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

#[derive(Debug, Error)]
pub enum IssuerError {
    #[error("Authority rejected refresh ({status}): {body}")]
    Rejected { body: String, status: u16 },
    #[error("Error sending request to authority: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Error deserializing token body from authority: {0}")]
    TokenBody(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct RefreshRequest {
    pub authorization_server: String,
    pub client_id: String,
    pub refresh_token: String,
    pub scopes: Vec<String>,
}

/// Token endpoint response (RFC 6749 §5.1)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssuedToken {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Present when the authority rotates refresh tokens
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default = "bearer")]
    pub token_type: String,
}

fn bearer() -> String {
    "Bearer".to_string()
}

impl IssuedToken {
    pub fn expires_in_or_default(&self) -> u64 {
        self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS)
    }

    /// Scopes granted, split from the space-delimited `scope` field.
    pub fn scopes(&self) -> Option<Vec<String>> {
        self.scope
            .as_ref()
            .map(|s| s.split_whitespace().map(str::to_string).collect())
    }
}

#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn refresh(&self, request: &RefreshRequest) -> Result<IssuedToken, IssuerError>;
}

/// Performs the `refresh_token` grant against an OAuth 2.1 token endpoint.
#[derive(Debug, Clone)]
pub struct HttpTokenIssuer {
    client: reqwest::Client,
    token_endpoint: Option<String>,
}

impl HttpTokenIssuer {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            token_endpoint: None,
        }
    }

    /// Send every request to `endpoint` instead of `{issuer}/token`.
    pub fn with_token_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.token_endpoint = Some(endpoint.into());
        self
    }

    fn endpoint_for(&self, authorization_server: &str) -> String {
        match &self.token_endpoint {
            Some(endpoint) => endpoint.clone(),
            None => format!("{}/token", authorization_server.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl TokenIssuer for HttpTokenIssuer {
    async fn refresh(&self, request: &RefreshRequest) -> Result<IssuedToken, IssuerError> {
        let url = self.endpoint_for(&request.authorization_server);
        let scope = request.scopes.join(" ");

        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", request.refresh_token.as_str()),
            ("client_id", request.client_id.as_str()),
        ];
        if !scope.is_empty() {
            form.push(("scope", scope.as_str()));
        }

        tracing::trace!(token_url = %url, client_id = %request.client_id, "requesting token refresh");
        let resp = self.client.post(&url).form(&form).send().await?;

        let status = resp.status();
        tracing::debug!(
            response.status = status.as_u16(),
            "received token response from issuing authority"
        );

        if !status.is_success() {
            let body = resp.text().await?;
            return Err(IssuerError::Rejected {
                body,
                status: status.as_u16(),
            });
        }

        let body = resp.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}
