//! Campaign mailer - resumable, rate-limited personalized email campaigns.
//!
//! This library holds the dispatch engine behind the `campaign-mailer` binary:
//! - `recipients`: merge MongoDB and JSON file sources into one unique list
//! - `template`: spintax and `{{variable}}` rendering per recipient
//! - `progress`: crash-safe record of who has been sent
//! - `schedule`: interval, hourly and daily send gating
//! - `dispatch`: the send loop tying them together
//!
//! ## Architecture
//!
//! ```text
//! Sources → aggregate → Dispatcher ─ render → Scheduler → Transport → ProgressStore
//! ```

pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod progress;
pub mod recipients;
pub mod schedule;
pub mod shutdown;
pub mod template;
pub mod transport;

// Re-export commonly used types
pub use config::Config;
pub use dispatch::{DispatchOptions, Dispatcher, RunOutcome, RunSummary};
pub use error::{MailerError, Result};
pub use progress::{DryRunLedger, ProgressLedger, ProgressRecord, ProgressStore};
pub use recipients::{aggregate, Recipient};
pub use schedule::{Action, Scheduler};
pub use template::{RenderedEmail, Renderer, Template};
pub use transport::{Transport, TransportError};
