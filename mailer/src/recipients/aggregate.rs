//! Merge recipient sources into one deduplicated, order-stable list.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use super::types::Recipient;
use crate::error::MalformedRecipient;

/// Output of [`aggregate`].
#[derive(Debug, Default)]
pub struct Aggregated {
    /// Unique recipients, source A first, in source order
    pub recipients: Vec<Recipient>,
    /// Records rejected as malformed
    pub rejected: Vec<MalformedRecipient>,
    /// Valid records dropped because their identity was already seen
    pub duplicates: usize,
}

/// Merge two recipient sources.
///
/// Source A is consumed fully before source B. The first occurrence of an
/// identity wins, so on duplicates the earlier source's display name is kept.
/// Malformed records are logged and excluded without failing the batch.
pub fn aggregate<A, B>(source_a: A, source_b: B) -> Aggregated
where
    A: IntoIterator<Item = Result<Recipient, MalformedRecipient>>,
    B: IntoIterator<Item = Result<Recipient, MalformedRecipient>>,
{
    let mut seen = HashSet::new();
    let mut out = Aggregated::default();

    for item in source_a.into_iter().chain(source_b) {
        match item {
            Ok(recipient) => {
                if seen.insert(recipient.email.clone()) {
                    out.recipients.push(recipient);
                } else {
                    debug!(recipient = %recipient.email, "recipient_duplicate_dropped");
                    out.duplicates += 1;
                }
            }
            Err(e) => {
                warn!(
                    source = %e.source_name,
                    reason = %e.reason,
                    "recipient_malformed"
                );
                out.rejected.push(e);
            }
        }
    }

    info!(
        unique = out.recipients.len(),
        duplicates = out.duplicates,
        rejected = out.rejected.len(),
        "recipients_aggregated"
    );

    out
}
