//! Command line surface.

use std::path::PathBuf;

use clap::Parser;

/// Resumable, rate-limited personalized email campaign sender
#[derive(Debug, Parser)]
#[command(name = "campaign-mailer", version, about)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config/config.json")]
    pub config: PathBuf,

    /// Render and schedule everything but send nothing and persist nothing
    #[arg(long)]
    pub dry_run: bool,

    /// Send only to this address instead of the configured sources
    #[arg(long, value_name = "ADDRESS")]
    pub to: Option<String>,

    /// Stop after this many new sends
    #[arg(long, value_name = "N")]
    pub limit: Option<usize>,

    /// Clear campaign progress first; exits afterwards unless combined with
    /// --dry-run, --limit or --to
    #[arg(long)]
    pub reset: bool,
}

impl Cli {
    /// `--reset` given on its own.
    pub fn reset_only(&self) -> bool {
        self.reset && !self.dry_run && self.limit.is_none() && self.to.is_none()
    }
}
