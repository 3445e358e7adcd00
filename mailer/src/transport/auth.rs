//! OAuth access tokens for the Gmail API.
//!
//! Reads a Google "authorized user" token file and refreshes it with the
//! stored refresh token when it is about to expire. The interactive consent
//! flow is not handled here: without a usable token the send fails with
//! [`TransportError::AuthExpired`] and the operator must re-authorize.

use std::path::PathBuf;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::TransportError;
use crate::progress::write_atomic;

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Refresh this long before the recorded expiry.
fn expiry_margin() -> Duration {
    Duration::seconds(60)
}

/// Google authorized-user credentials as written by the OAuth client libraries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizedUser {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub expiry: Option<DateTime<Utc>>,
    /// Anything else in the file, kept on rewrite
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl AuthorizedUser {
    /// Access token still good at `now`, if any.
    pub fn valid_token(&self, now: DateTime<Utc>) -> Option<&str> {
        let token = self.token.as_deref().filter(|t| !t.is_empty())?;
        match self.expiry {
            Some(expiry) if expiry - expiry_margin() <= now => None,
            _ => Some(token),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Token file plus an in-memory cache.
pub struct TokenStore {
    path: PathBuf,
    client: Client,
    cached: Mutex<Option<AuthorizedUser>>,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>, client: Client) -> Self {
        Self {
            path: path.into(),
            client,
            cached: Mutex::new(None),
        }
    }

    /// A bearer token valid for at least another minute.
    pub async fn access_token(&self) -> Result<String, TransportError> {
        let mut cached = self.cached.lock().await;

        if cached.is_none() {
            *cached = Some(self.read_file().await?);
        }
        let Some(user) = cached.as_mut() else {
            return Err(TransportError::AuthExpired("token not loaded".to_string()));
        };

        if let Some(token) = user.valid_token(Utc::now()) {
            return Ok(token.to_string());
        }

        self.refresh(user).await?;
        user.token
            .clone()
            .ok_or_else(|| TransportError::AuthExpired("refresh returned no token".to_string()))
    }

    /// Forget the current access token so the next call refreshes it.
    pub async fn invalidate(&self) {
        if let Some(user) = self.cached.lock().await.as_mut() {
            user.expiry = Some(Utc::now());
        }
    }

    async fn read_file(&self) -> Result<AuthorizedUser, TransportError> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            TransportError::AuthExpired(format!(
                "cannot read {} ({}); authorize the sending account first",
                self.path.display(),
                e
            ))
        })?;

        serde_json::from_str(&raw).map_err(|e| {
            TransportError::AuthExpired(format!("{} is not a valid token file: {}", self.path.display(), e))
        })
    }

    async fn refresh(&self, user: &mut AuthorizedUser) -> Result<(), TransportError> {
        let (Some(refresh_token), Some(client_id), Some(client_secret)) = (
            user.refresh_token.clone(),
            user.client_id.clone(),
            user.client_secret.clone(),
        ) else {
            return Err(TransportError::AuthExpired(
                "access token expired and the token file has no refresh credentials".to_string(),
            ));
        };

        info!(token_uri = %user.token_uri, "oauth_token_refreshing");

        let response = self
            .client
            .post(&user.token_uri)
            .timeout(StdDuration::from_secs(30))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| TransportError::Transient(format!("token refresh failed: {}", e)))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(TransportError::Transient(format!("token endpoint returned {}", status)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), body = %body, "oauth_token_refresh_rejected");
            return Err(TransportError::AuthExpired(format!(
                "token refresh rejected ({}); re-authorize the sending account",
                status
            )));
        }

        let refreshed: RefreshResponse = response
            .json()
            .await
            .map_err(|e| TransportError::Transient(format!("bad token response: {}", e)))?;

        user.token = Some(refreshed.access_token);
        user.expiry = refreshed
            .expires_in
            .map(|secs| Utc::now() + Duration::seconds(secs));

        if let Err(e) = write_atomic(&self.path, &*user) {
            warn!(path = %self.path.display(), error = %e, "oauth_token_save_failed");
        } else {
            info!(path = %self.path.display(), expiry = ?user.expiry, "oauth_token_refreshed");
        }

        Ok(())
    }
}
