//! Gmail API transport.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use super::message::encode_raw;
use super::{TokenStore, Transport, TransportError};
use crate::config::GmailConfig;
use crate::error::{MailerError, Result};
use crate::template::RenderedEmail;

/// `error.errors[].reason` values Google uses for quota and rate limits.
const QUOTA_REASONS: &[&str] = &[
    "rateLimitExceeded",
    "userRateLimitExceeded",
    "dailyLimitExceeded",
    "quotaExceeded",
];

pub struct GmailTransport {
    client: Client,
    send_url: String,
    tokens: TokenStore,
}

impl GmailTransport {
    pub fn new(config: &GmailConfig, token_path: impl Into<PathBuf>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| MailerError::Config(format!("failed to create HTTP client: {}", e)))?;

        let send_url = format!(
            "{}/gmail/v1/users/me/messages/send",
            config.api_base.trim_end_matches('/')
        );

        Ok(Self {
            tokens: TokenStore::new(token_path, client.clone()),
            client,
            send_url,
        })
    }

    async fn post(&self, raw: &str) -> std::result::Result<reqwest::Response, TransportError> {
        let token = self.tokens.access_token().await?;

        self.client
            .post(&self.send_url)
            .bearer_auth(token)
            .json(&json!({ "raw": raw }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    error!(url = %self.send_url, error = %e, "gmail_send_timeout");
                } else {
                    error!(url = %self.send_url, error = %e, "gmail_send_request_error");
                }
                classify_request_error(&e)
            })
    }
}

#[async_trait]
impl Transport for GmailTransport {
    async fn send(&self, email: &RenderedEmail, sender: &str) -> std::result::Result<(), TransportError> {
        let raw = encode_raw(email, sender);

        let mut response = self.post(&raw).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            // Token revoked or expired early; refresh once before giving up
            warn!(to = %email.to.email, "gmail_send_unauthorized_refreshing");
            self.tokens.invalidate().await;
            response = self.post(&raw).await?;
        }

        let status = response.status();
        if status.is_success() {
            let id = response
                .json::<Value>()
                .await
                .ok()
                .and_then(|v| v.get("id").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_default();
            info!(to = %email.to.email, message_id = %id, "gmail_send_complete");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let err = classify_response(status.as_u16(), &body);
        warn!(
            to = %email.to.email,
            status_code = status.as_u16(),
            error = %err,
            "gmail_send_failed"
        );
        Err(err)
    }
}

/// Map a non-success Gmail API response onto the transport error classes.
pub fn classify_response(status: u16, body: &str) -> TransportError {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let error = parsed.as_ref().and_then(|v| v.get("error"));

    let message = error
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("HTTP {}", status));

    let quota_reason = error
        .and_then(|e| e.get("errors"))
        .and_then(Value::as_array)
        .map(|errors| {
            errors.iter().any(|e| {
                e.get("reason")
                    .and_then(Value::as_str)
                    .is_some_and(|r| QUOTA_REASONS.contains(&r))
            })
        })
        .unwrap_or(false);

    match status {
        429 => TransportError::QuotaExceeded(message),
        403 if quota_reason => TransportError::QuotaExceeded(message),
        401 | 403 => TransportError::AuthExpired(message),
        408 | 500..=599 => TransportError::Transient(message),
        _ => TransportError::PermanentRejection(message),
    }
}

fn classify_request_error(e: &reqwest::Error) -> TransportError {
    if e.is_builder() {
        TransportError::PermanentRejection(e.to_string())
    } else {
        TransportError::Transient(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn google_error(code: u16, reason: &str, message: &str) -> String {
        json!({
            "error": {
                "code": code,
                "message": message,
                "errors": [{ "domain": "usageLimits", "reason": reason, "message": message }]
            }
        })
        .to_string()
    }

    #[test]
    fn test_classify_quota() {
        let body = google_error(403, "dailyLimitExceeded", "Daily Limit Exceeded");
        assert_eq!(
            classify_response(403, &body),
            TransportError::QuotaExceeded("Daily Limit Exceeded".to_string())
        );

        let body = google_error(429, "rateLimitExceeded", "Rate Limit Exceeded");
        assert!(matches!(classify_response(429, &body), TransportError::QuotaExceeded(_)));
        assert!(matches!(classify_response(429, ""), TransportError::QuotaExceeded(_)));
    }

    #[test]
    fn test_classify_auth() {
        assert!(matches!(
            classify_response(401, &google_error(401, "authError", "Invalid Credentials")),
            TransportError::AuthExpired(_)
        ));
        assert!(matches!(
            classify_response(403, &google_error(403, "insufficientPermissions", "Insufficient Permission")),
            TransportError::AuthExpired(_)
        ));
    }

    #[test]
    fn test_classify_transient_and_permanent() {
        assert!(matches!(classify_response(503, "<html>"), TransportError::Transient(_)));
        assert!(matches!(classify_response(500, ""), TransportError::Transient(_)));

        let body = google_error(400, "invalidArgument", "Invalid To header");
        assert_eq!(
            classify_response(400, &body),
            TransportError::PermanentRejection("Invalid To header".to_string())
        );
    }

    #[test]
    fn test_unparseable_body_uses_status() {
        assert_eq!(
            classify_response(404, "not json"),
            TransportError::PermanentRejection("HTTP 404".to_string())
        );
    }

    #[test]
    fn test_send_url_trims_slash() {
        let config = GmailConfig {
            api_base: "http://localhost:9/".to_string(),
            request_timeout_ms: 100,
        };
        let transport = GmailTransport::new(&config, "token.json").unwrap();
        assert_eq!(transport.send_url, "http://localhost:9/gmail/v1/users/me/messages/send");
    }
}
