//! Error taxonomy for the campaign dispatcher.
//!
//! Errors that would risk a duplicate or lost send are fatal and bubble up to
//! the binary. Errors that only affect one recipient are recovered locally.

use std::path::PathBuf;

use thiserror::Error;

use crate::transport::TransportError;

/// Result alias used across the library.
pub type Result<T> = std::result::Result<T, MailerError>;

/// A recipient record that cannot be turned into a [`crate::Recipient`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed recipient from {source_name}: {reason}")]
pub struct MalformedRecipient {
    /// Which source produced the record
    pub source_name: String,
    /// Why it was rejected
    pub reason: String,
}

impl MalformedRecipient {
    pub fn new(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }
}

/// Template definition or spintax syntax problem.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("template must start with a 'SUBJECT:' line")]
    MissingSubjectMarker,

    #[error("template is missing the '---' separator line between subject and body")]
    MissingSeparator,

    #[error("template subject must be a single line")]
    MultilineSubject,

    #[error("unmatched '{{' opened at byte {offset} in {part}")]
    UnclosedChoice { part: &'static str, offset: usize },

    #[error("unmatched '}}' at byte {offset} in {part}")]
    UnopenedChoice { part: &'static str, offset: usize },
}

/// Top-level error for the dispatcher.
#[derive(Debug, Error)]
pub enum MailerError {
    #[error(transparent)]
    MalformedRecipient(#[from] MalformedRecipient),

    #[error("template format error: {0}")]
    TemplateFormat(#[from] TemplateError),

    #[error("progress file {path} is corrupt: {reason}")]
    ProgressStoreCorrupt { path: PathBuf, reason: String },

    #[error("progress file {path} is locked by another running instance")]
    ProgressLocked { path: PathBuf },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl MailerError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        MailerError::Io {
            path: path.into(),
            source,
        }
    }
}
