//! Recipient identity and the raw-record mapping shared by every source.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::MalformedRecipient;

/// Name used when a recipient has no usable display name.
pub const NAME_FALLBACK: &str = "there";

/// Normalize an email address into its identity key.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// A campaign recipient.
///
/// `email` always holds the normalized identity, so two recipients are the
/// same person exactly when their `email` fields are equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    /// Normalized (trimmed, lower-cased) email address
    pub email: String,
    /// Full display name, if the source had one
    pub display_name: Option<String>,
    /// Extra template values keyed by template token
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl Recipient {
    /// Build a recipient, rejecting blank or obviously invalid addresses.
    pub fn new(
        source_name: &str,
        email: &str,
        display_name: Option<&str>,
    ) -> Result<Self, MalformedRecipient> {
        let email = normalize_email(email);
        if email.is_empty() {
            return Err(MalformedRecipient::new(source_name, "email is empty"));
        }
        if !email.contains('@') {
            return Err(MalformedRecipient::new(
                source_name,
                format!("'{}' is not an email address", email),
            ));
        }

        let display_name = display_name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string);

        Ok(Self {
            email,
            display_name,
            attributes: BTreeMap::new(),
        })
    }

    /// Add a template attribute.
    pub fn with_attribute(mut self, token: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(token.into(), value.into());
        self
    }

    /// Recipient for a single `--to` override address.
    ///
    /// The display name is guessed from the local part: `jane.doe@x.com`
    /// becomes `Jane`.
    pub fn from_override(address: &str) -> Result<Self, MalformedRecipient> {
        let guessed = address
            .trim()
            .split('@')
            .next()
            .and_then(|local| local.split(['.', '_', '+']).next())
            .filter(|s| !s.is_empty())
            .map(capitalize);

        Self::new("override", address, guessed.as_deref())
    }

    /// Display name or the fallback token.
    pub fn name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(NAME_FALLBACK)
    }

    /// First whitespace-delimited token of the display name, or the fallback.
    pub fn first_name(&self) -> &str {
        self.display_name
            .as_deref()
            .and_then(|n| n.split_whitespace().next())
            .unwrap_or(NAME_FALLBACK)
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

/// Field names used to turn a raw source record into a [`Recipient`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMapping {
    /// Record field holding the email address
    #[serde(default = "default_email_field")]
    pub email_field: String,
    /// Record field holding the full name
    #[serde(default = "default_name_field")]
    pub name_field: String,
    /// Template token -> record field, for additional `{{token}}` variables
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

fn default_email_field() -> String {
    "email".to_string()
}

fn default_name_field() -> String {
    "name".to_string()
}

impl Default for RecordMapping {
    fn default() -> Self {
        Self {
            email_field: default_email_field(),
            name_field: default_name_field(),
            fields: BTreeMap::new(),
        }
    }
}

impl RecordMapping {
    /// Map one raw record.
    pub fn map(&self, source_name: &str, record: &Value) -> Result<Recipient, MalformedRecipient> {
        let email = match record.get(&self.email_field) {
            Some(Value::String(s)) => s.as_str(),
            Some(other) => {
                return Err(MalformedRecipient::new(
                    source_name,
                    format!("field '{}' is not a string: {}", self.email_field, other),
                ))
            }
            None => {
                return Err(MalformedRecipient::new(
                    source_name,
                    format!("missing '{}' field", self.email_field),
                ))
            }
        };

        let name = record.get(&self.name_field).and_then(Value::as_str);
        let mut recipient = Recipient::new(source_name, email, name)?;

        for (token, field) in &self.fields {
            if let Some(value) = record.get(field).and_then(scalar_to_string) {
                recipient.attributes.insert(token.clone(), value);
            }
        }

        Ok(recipient)
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
