//! Recipient identities and the sources they come from.
//!
//! ```text
//! MongoSource ─┐
//!              ├─ aggregate() → ordered, unique Vec<Recipient>
//! JsonFileSource ┘
//! ```

pub mod aggregate;
pub mod sources;
pub mod types;

pub use aggregate::{aggregate, Aggregated};
pub use sources::{JsonFileSource, MongoSource, RecipientSource};
pub use types::{normalize_email, Recipient, RecordMapping, NAME_FALLBACK};

use crate::config::{Config, SourcePriority};

/// Fetch every configured source and merge them in priority order.
pub async fn load_recipients(config: &Config) -> Aggregated {
    let mongo = MongoSource::new(config.mongodb.clone());
    let file = JsonFileSource::new(
        config.paths.recipients.clone(),
        config.recipients_file.clone(),
    );

    let (first, second): (&dyn RecipientSource, &dyn RecipientSource) =
        match config.source_priority {
            SourcePriority::MongodbFirst => (&mongo, &file),
            SourcePriority::FileFirst => (&file, &mongo),
        };

    let (a, b) = futures::join!(first.fetch(), second.fetch());
    aggregate(a, b)
}
