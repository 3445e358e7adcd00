//! Email template parsing and per-recipient rendering.
//!
//! A template definition looks like:
//!
//! ```text
//! SUBJECT: {Quick|Short} question, {{first_name}}
//! ---
//! {Hi|Hey} {{first_name}},
//! ...
//! ```

pub mod spintax;

use std::collections::BTreeSet;
use std::path::Path;

use serde::Serialize;
use tracing::info;

use crate::error::{MailerError, Result, TemplateError};
use crate::recipients::Recipient;
pub use spintax::{Chooser, FnChooser, Node, RandomChooser};

/// Marker that must open the first line.
pub const SUBJECT_MARKER: &str = "SUBJECT:";

/// Line separating subject from body.
pub const SEPARATOR: &str = "---";

/// A parsed template. Parsing happens once at startup; rendering many times.
#[derive(Debug, Clone)]
pub struct Template {
    pub subject_raw: String,
    pub body_raw: String,
    subject: Vec<Node>,
    body: Vec<Node>,
}

impl Template {
    /// Parse a template definition.
    pub fn parse(definition: &str) -> std::result::Result<Self, TemplateError> {
        if !definition.trim_start().starts_with(SUBJECT_MARKER) {
            return Err(TemplateError::MissingSubjectMarker);
        }

        let (head, body) = split_at_separator(definition).ok_or(TemplateError::MissingSeparator)?;

        let subject_raw = head
            .trim()
            .strip_prefix(SUBJECT_MARKER)
            .ok_or(TemplateError::MissingSubjectMarker)?
            .trim()
            .to_string();
        if subject_raw.contains('\n') {
            return Err(TemplateError::MultilineSubject);
        }

        let body_raw = body.trim().to_string();

        Ok(Self {
            subject: spintax::parse(&subject_raw, "subject")?,
            body: spintax::parse(&body_raw, "body")?,
            subject_raw,
            body_raw,
        })
    }

    /// Read and parse a template file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| MailerError::io(path, e))?;
        let template = Self::parse(&raw)?;

        info!(
            path = %path.display(),
            subject_length = template.subject_raw.len(),
            body_length = template.body_raw.len(),
            "template_loaded"
        );

        Ok(template)
    }
}

/// Split at the first line that contains only the separator.
fn split_at_separator(definition: &str) -> Option<(&str, &str)> {
    let mut offset = 0;
    for line in definition.split_inclusive('\n') {
        if line.trim() == SEPARATOR {
            return Some((&definition[..offset], &definition[offset + line.len()..]));
        }
        offset += line.len();
    }
    None
}

/// A fully resolved email for one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedEmail {
    pub to: Recipient,
    pub subject: String,
    pub body: String,
}

/// Renders a [`Template`] for each recipient.
///
/// Built-in variables are `first_name`, `name` and `email`. `tokens` lists the
/// additional variables filled from recipient attributes; a listed token the
/// recipient lacks renders empty, and anything else is left verbatim.
pub struct Renderer<C> {
    template: Template,
    tokens: BTreeSet<String>,
    chooser: C,
}

impl<C: Chooser> Renderer<C> {
    pub fn new(template: Template, tokens: BTreeSet<String>, chooser: C) -> Self {
        Self {
            template,
            tokens,
            chooser,
        }
    }

    /// Render a fresh email for `recipient`.
    pub fn render(&mut self, recipient: &Recipient) -> RenderedEmail {
        let tokens = &self.tokens;
        let lookup = |name: &str| {
            match name {
                "first_name" => Some(recipient.first_name()),
                "name" => Some(recipient.name()),
                "email" => Some(recipient.email.as_str()),
                other if tokens.contains(other) => Some(
                    recipient
                        .attributes
                        .get(other)
                        .map(String::as_str)
                        .unwrap_or(""),
                ),
                _ => None,
            }
        };

        let mut subject = String::new();
        spintax::expand(&self.template.subject, &lookup, &mut self.chooser, &mut subject);
        let subject = subject
            .replace(['\r', '\n'], " ")
            .trim()
            .to_string();

        let mut body = String::new();
        spintax::expand(&self.template.body, &lookup, &mut self.chooser, &mut body);

        RenderedEmail {
            to: recipient.clone(),
            subject,
            body,
        }
    }
}
