//! Configuration loading.
//!
//! Settings come from a JSON file (`config/config.json` by default). A few
//! rate-limit and template settings can be overridden from the environment;
//! invalid override values are logged and ignored.

use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::error::{MailerError, Result};
use crate::recipients::RecordMapping;

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Campaign label stored in the progress file
    pub campaign: String,

    /// Value of the `From` header
    pub sender_name: String,

    pub rate_limiting: RateLimitConfig,

    /// Recipient source A
    pub mongodb: MongoConfig,

    /// Field mapping for the recipients JSON file (source B)
    pub recipients_file: RecordMapping,

    /// Which source wins when both list the same address
    pub source_priority: SourcePriority,

    pub paths: PathsConfig,

    pub retry: RetryConfig,

    pub gmail: GmailConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            campaign: "email-campaign".to_string(),
            sender_name: "Mailer".to_string(),
            rate_limiting: RateLimitConfig::default(),
            mongodb: MongoConfig::default(),
            recipients_file: RecordMapping::default(),
            source_priority: SourcePriority::default(),
            paths: PathsConfig::default(),
            retry: RetryConfig::default(),
            gmail: GmailConfig::default(),
        }
    }
}

/// Provider-imposed sending limits.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Rolling one-hour cap; 0 disables the hourly cap
    pub emails_per_hour: u32,
    /// Minimum seconds between two sends, before jitter
    pub base_interval_seconds: u64,
    /// Lower bound of the random extra delay, in seconds
    pub jitter_range_min: u64,
    /// Upper bound of the random extra delay, in seconds
    pub jitter_range_max: u64,
    /// Sends allowed per UTC day; 0 disables sending
    pub daily_limit: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            emails_per_hour: 20,
            base_interval_seconds: 180,
            jitter_range_min: 0,
            jitter_range_max: 45,
            daily_limit: 100,
        }
    }
}

/// MongoDB recipient source settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MongoConfig {
    pub enabled: bool,
    pub uri: String,
    pub database: String,
    pub collection: String,
    pub email_field: String,
    pub name_field: String,
    /// Query filter document, as JSON
    pub filter: Value,
    /// Template token -> document field
    pub fields: BTreeMap<String, String>,
}

impl Default for MongoConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            uri: "mongodb://localhost:27017".to_string(),
            database: String::new(),
            collection: String::new(),
            email_field: "email".to_string(),
            name_field: "name".to_string(),
            filter: Value::Null,
            fields: BTreeMap::new(),
        }
    }
}

impl MongoConfig {
    /// Record mapping for documents from this source.
    pub fn mapping(&self) -> RecordMapping {
        RecordMapping {
            email_field: self.email_field.clone(),
            name_field: self.name_field.clone(),
            fields: self.fields.clone(),
        }
    }
}

/// Dedup precedence between the two recipient sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourcePriority {
    #[default]
    MongodbFirst,
    FileFirst,
}

/// File locations, relative to the working directory unless absolute.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub progress: PathBuf,
    pub recipients: PathBuf,
    pub template: PathBuf,
    pub token: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            progress: PathBuf::from("data/progress.json"),
            recipients: PathBuf::from("data/emails.json"),
            template: PathBuf::from("data/template.txt"),
            token: PathBuf::from("data/token.json"),
        }
    }
}

/// Transient send failure handling.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per recipient before a transient failure becomes fatal
    pub max_send_attempts: u32,
    /// Pause between attempts, in seconds
    pub retry_backoff_seconds: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_send_attempts: 3,
            retry_backoff_seconds: 30,
        }
    }
}

/// Gmail API client settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GmailConfig {
    pub api_base: String,
    /// HTTP request timeout in milliseconds
    pub request_timeout_ms: u64,
}

impl Default for GmailConfig {
    fn default() -> Self {
        Self {
            api_base: "https://gmail.googleapis.com".to_string(),
            request_timeout_ms: 8000,
        }
    }
}

/// Upper bound for any configured delay (interval, jitter, retry backoff).
pub const MAX_DELAY_SECONDS: u64 = 7 * 24 * 60 * 60;

impl Config {
    /// Load the JSON config file, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MailerError::Config(format!(
                    "{} not found; copy config/config.example.json there and fill in your settings",
                    path.display()
                )))
            }
            Err(e) => return Err(MailerError::io(path, e)),
        };

        let mut config: Config = serde_json::from_str(&raw)
            .map_err(|e| MailerError::Config(format!("{}: {}", path.display(), e)))?;

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Override settings from `MAILER_*` environment variables.
    pub fn apply_env_overrides(&mut self) {
        let rate = &mut self.rate_limiting;

        if let Some(v) = parse_var("MAILER_DAILY_LIMIT") {
            rate.daily_limit = v;
        }
        if let Some(v) = parse_var("MAILER_EMAILS_PER_HOUR") {
            rate.emails_per_hour = v;
        }
        if let Some(v) = parse_var("MAILER_BASE_INTERVAL_SECONDS") {
            rate.base_interval_seconds = v;
        }

        let (min, max) = parse_range(
            "MAILER_JITTER_RANGE_SECONDS",
            (rate.jitter_range_min, rate.jitter_range_max),
        );
        rate.jitter_range_min = min;
        rate.jitter_range_max = max;

        if let Ok(name) = env::var("MAILER_SENDER_NAME") {
            self.sender_name = name;
        }

        // Fields named here map to a same-named token in both sources
        if let Some(fields) = parse_csv("MAILER_TEMPLATE_FIELDS") {
            for field in fields {
                self.recipients_file
                    .fields
                    .entry(field.clone())
                    .or_insert_with(|| field.clone());
                self.mongodb.fields.entry(field.clone()).or_insert(field);
            }
        }
    }

    /// Reject settings the scheduler cannot honor.
    pub fn validate(&self) -> Result<()> {
        let rate = &self.rate_limiting;
        if rate.jitter_range_min > rate.jitter_range_max {
            return Err(MailerError::Config(format!(
                "jitter_range_min ({}) is greater than jitter_range_max ({})",
                rate.jitter_range_min, rate.jitter_range_max
            )));
        }
        for (name, value) in [
            ("rate_limiting.base_interval_seconds", rate.base_interval_seconds),
            ("rate_limiting.jitter_range_max", rate.jitter_range_max),
            ("retry.retry_backoff_seconds", self.retry.retry_backoff_seconds),
        ] {
            if value > MAX_DELAY_SECONDS {
                return Err(MailerError::Config(format!(
                    "{} ({}) exceeds the maximum of {} seconds",
                    name, value, MAX_DELAY_SECONDS
                )));
            }
        }
        if self.retry.max_send_attempts == 0 {
            return Err(MailerError::Config(
                "retry.max_send_attempts must be at least 1".to_string(),
            ));
        }
        if self.mongodb.enabled
            && (self.mongodb.database.is_empty() || self.mongodb.collection.is_empty())
        {
            return Err(MailerError::Config(
                "mongodb.database and mongodb.collection are required when mongodb is enabled"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Extra template tokens the recipient sources can fill in.
    pub fn template_tokens(&self) -> BTreeSet<String> {
        self.recipients_file
            .fields
            .keys()
            .chain(self.mongodb.fields.keys())
            .cloned()
            .collect()
    }
}

/// Parse a single environment variable, warning when it is set but invalid.
fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(env_var = name, value = %raw, "Invalid value, keeping configured setting");
            None
        }
    }
}

/// Parse a comma-separated range like "0,45" into a tuple.
fn parse_range(name: &str, default: (u64, u64)) -> (u64, u64) {
    let raw = match env::var(name) {
        Ok(v) => v,
        Err(_) => return default,
    };

    let parts: Vec<&str> = raw.split(',').collect();
    if parts.len() != 2 {
        warn!(env_var = name, value = %raw, "Invalid range format, using default");
        return default;
    }

    let min = parts[0].trim().parse::<u64>();
    let max = parts[1].trim().parse::<u64>();

    match (min, max) {
        (Ok(min), Ok(max)) if min <= max => (min, max),
        _ => {
            warn!(env_var = name, value = %raw, "Invalid range values, using default");
            default
        }
    }
}

/// Parse a comma-separated list of strings.
fn parse_csv(name: &str) -> Option<Vec<String>> {
    env::var(name).ok().map(|raw| {
        raw.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}
