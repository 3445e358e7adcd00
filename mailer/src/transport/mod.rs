//! Mail transport boundary.
//!
//! The dispatch loop only depends on [`Transport`] and the four-way
//! [`TransportError`] classification. The Gmail client is one implementation;
//! [`DryRunTransport`] is the no-op used by `--dry-run`.

pub mod auth;
pub mod gmail;
pub mod message;

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::template::RenderedEmail;

pub use auth::TokenStore;
pub use gmail::GmailTransport;

/// Classified send failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Credentials are missing, expired or revoked; needs re-authorization
    #[error("authorization expired: {0}")]
    AuthExpired(String),

    /// Provider quota hit; stop for now and resume later
    #[error("sending quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Network trouble or provider hiccup; the same send may be retried
    #[error("transient transport failure: {0}")]
    Transient(String),

    /// The provider refused this particular message for good
    #[error("message rejected: {0}")]
    PermanentRejection(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, email: &RenderedEmail, sender: &str) -> Result<(), TransportError>;
}

/// Transport that sends nothing and logs what it would have sent.
#[derive(Default)]
pub struct DryRunTransport {
    previewed: AtomicUsize,
}

impl DryRunTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of emails that went through this transport.
    pub fn previewed(&self) -> usize {
        self.previewed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Transport for DryRunTransport {
    async fn send(&self, email: &RenderedEmail, sender: &str) -> Result<(), TransportError> {
        let index = self.previewed.fetch_add(1, Ordering::Relaxed) + 1;

        if index == 1 {
            info!(
                to = %email.to.email,
                from = %sender,
                subject = %email.subject,
                body = %email.body,
                "dry_run_sample_email"
            );
        } else {
            info!(
                index = index,
                to = %email.to.email,
                first_name = %email.to.first_name(),
                subject = %email.subject,
                "dry_run_would_send"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipients::Recipient;

    #[tokio::test]
    async fn test_dry_run_transport_counts() {
        let transport = DryRunTransport::new();
        let email = RenderedEmail {
            to: Recipient::new("test", "a@x.com", None).unwrap(),
            subject: "s".to_string(),
            body: "b".to_string(),
        };

        transport.send(&email, "Me").await.unwrap();
        transport.send(&email, "Me").await.unwrap();
        assert_eq!(transport.previewed(), 2);
    }
}
