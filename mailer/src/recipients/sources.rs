//! Recipient sources: a JSON file and (optionally) a MongoDB collection.
//!
//! Sources only fetch raw records and run them through a [`RecordMapping`].
//! A source that cannot be read is logged and yields nothing, so one broken
//! source never blocks the other.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info};

use super::types::{Recipient, RecordMapping};
use crate::config::MongoConfig;
use crate::error::MalformedRecipient;

/// Output item of a source.
pub type SourceItem = Result<Recipient, MalformedRecipient>;

/// Something that produces recipient records.
#[async_trait]
pub trait RecipientSource: Send + Sync {
    /// Short name used in logs and malformed-record errors.
    fn name(&self) -> &str;

    /// Fetch and map all records.
    async fn fetch(&self) -> Vec<SourceItem>;
}

/// Map a batch of raw records.
pub fn map_records(source_name: &str, mapping: &RecordMapping, records: &[Value]) -> Vec<SourceItem> {
    records.iter().map(|r| mapping.map(source_name, r)).collect()
}

/// `{"recipients": [{"email": "...", "name": "..."}]}`
#[derive(Debug, Deserialize)]
struct RecipientsFile {
    #[serde(default)]
    recipients: Vec<Value>,
}

/// Recipients listed in a local JSON file.
pub struct JsonFileSource {
    path: PathBuf,
    mapping: RecordMapping,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>, mapping: RecordMapping) -> Self {
        Self {
            path: path.into(),
            mapping,
        }
    }

    fn parse(&self, raw: &str) -> Result<Vec<Value>, serde_json::Error> {
        let file: RecipientsFile = serde_json::from_str(raw)?;
        Ok(file.recipients)
    }
}

#[async_trait]
impl RecipientSource for JsonFileSource {
    fn name(&self) -> &str {
        "json"
    }

    async fn fetch(&self) -> Vec<SourceItem> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "recipients_file_absent");
                return Vec::new();
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "recipients_file_read_failed");
                return Vec::new();
            }
        };

        match self.parse(&raw) {
            Ok(records) => {
                info!(
                    path = %self.path.display(),
                    records = records.len(),
                    "recipients_file_loaded"
                );
                map_records(self.name(), &self.mapping, &records)
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "recipients_file_parse_failed");
                Vec::new()
            }
        }
    }
}

/// Recipients queried from a MongoDB collection.
pub struct MongoSource {
    config: MongoConfig,
}

impl MongoSource {
    pub fn new(config: MongoConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RecipientSource for MongoSource {
    fn name(&self) -> &str {
        "mongodb"
    }

    async fn fetch(&self) -> Vec<SourceItem> {
        if !self.config.enabled {
            return Vec::new();
        }

        info!(
            database = %self.config.database,
            collection = %self.config.collection,
            "mongodb_connecting"
        );

        match mongo::fetch_records(&self.config).await {
            Ok(records) => {
                info!(records = records.len(), "mongodb_records_loaded");
                map_records(self.name(), &self.config.mapping(), &records)
            }
            Err(e) => {
                error!(error = %e, "mongodb_fetch_failed");
                Vec::new()
            }
        }
    }
}

#[cfg(feature = "mongodb")]
mod mongo {
    use std::time::Duration;

    use anyhow::{Context, Result};
    use futures::TryStreamExt;
    use mongodb::bson::{self, Document};
    use mongodb::options::ClientOptions;
    use mongodb::Client;
    use serde_json::Value;

    use crate::config::MongoConfig;

    pub async fn fetch_records(config: &MongoConfig) -> Result<Vec<Value>> {
        let mut options = ClientOptions::parse(&config.uri)
            .await
            .context("Failed to parse MongoDB URI")?;
        options.server_selection_timeout = Some(Duration::from_secs(10));

        let client = Client::with_options(options).context("Failed to build MongoDB client")?;
        let collection = client
            .database(&config.database)
            .collection::<Document>(&config.collection);

        let filter: Document = match &config.filter {
            Value::Null => Document::new(),
            other => bson::to_document(other).context("MongoDB filter must be an object")?,
        };

        let mut projection = Document::new();
        projection.insert(config.email_field.as_str(), 1);
        projection.insert(config.name_field.as_str(), 1);
        for field in config.fields.values() {
            projection.insert(field.as_str(), 1);
        }

        let mut cursor = collection
            .find(filter)
            .projection(projection)
            .await
            .context("MongoDB find failed")?;

        let mut records = Vec::new();
        while let Some(document) = cursor.try_next().await.context("MongoDB cursor failed")? {
            records.push(serde_json::to_value(&document).context("Failed to convert document")?);
        }

        client.shutdown().await;
        Ok(records)
    }
}

#[cfg(not(feature = "mongodb"))]
mod mongo {
    use anyhow::{bail, Result};
    use serde_json::Value;

    use crate::config::MongoConfig;

    pub async fn fetch_records(_config: &MongoConfig) -> Result<Vec<Value>> {
        bail!("MongoDB source is enabled but this build lacks the 'mongodb' feature")
    }
}
