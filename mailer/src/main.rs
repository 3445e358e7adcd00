//! campaign-mailer - resumable, rate-limited personalized email campaigns.
//!
//! Loads recipients and the template, then sends one email at a time through
//! the Gmail API within the configured hourly and daily limits. Progress is
//! committed after every send so an interrupted run picks up where it left off.

mod cli;

use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::Parser;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mailer::clock::{SimulatedClock, SystemClock};
use mailer::dispatch::{DispatchOptions, Dispatcher, RunSummary};
use mailer::progress::{DryRunLedger, ProgressLedger, ProgressStore};
use mailer::recipients::{load_recipients, Recipient};
use mailer::schedule::Scheduler;
use mailer::shutdown::Shutdown;
use mailer::template::spintax::RandomChooser;
use mailer::template::{Renderer, Template};
use mailer::transport::{DryRunTransport, GmailTransport};
use mailer::Config;

use cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "mailer_failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    tracing::info!(config = %cli.config.display(), dry_run = cli.dry_run, "mailer_starting");

    let config = Config::load(&cli.config).context("Failed to load configuration")?;
    tracing::info!(
        campaign = %config.campaign,
        sender_name = %config.sender_name,
        emails_per_hour = config.rate_limiting.emails_per_hour,
        daily_limit = config.rate_limiting.daily_limit,
        base_interval_seconds = config.rate_limiting.base_interval_seconds,
        jitter_range_min = config.rate_limiting.jitter_range_min,
        jitter_range_max = config.rate_limiting.jitter_range_max,
        mongodb_enabled = config.mongodb.enabled,
        "config_loaded"
    );

    let mut store = ProgressStore::open(&config.paths.progress, &config.campaign)?;

    let result = campaign(&cli, &config, &mut store).await;
    report_fatal(result, store.record().sent.len())
}

/// Log a fatal error together with the confirmed-sent count and attach the
/// count to the error.
fn report_fatal<T>(result: Result<T>, total_sent: usize) -> Result<T> {
    result.map_err(|e| {
        tracing::error!(error = %format!("{:#}", e), total_sent = total_sent, "mailer_fatal");
        e.context(format!("stopped with {} recipients confirmed sent", total_sent))
    })
}

async fn campaign(cli: &Cli, config: &Config, store: &mut ProgressStore) -> Result<()> {
    if cli.reset {
        store.reset()?;
        if cli.reset_only() {
            tracing::info!("reset_complete");
            return Ok(());
        }
    }

    let template = Template::load(&config.paths.template)?;

    let recipients = match &cli.to {
        Some(address) => {
            let recipient = Recipient::from_override(address)?;
            tracing::info!(recipient = %recipient.email, first_name = %recipient.first_name(), "recipient_override");
            vec![recipient]
        }
        None => {
            let aggregated = load_recipients(config).await;
            tracing::info!(
                recipients = aggregated.recipients.len(),
                rejected = aggregated.rejected.len(),
                duplicates = aggregated.duplicates,
                "recipients_loaded"
            );
            aggregated.recipients
        }
    };

    if recipients.is_empty() {
        tracing::warn!("no_recipients");
        return Ok(());
    }

    let renderer = Renderer::new(template, config.template_tokens(), RandomChooser::from_entropy());
    let scheduler = Scheduler::new(config.rate_limiting.clone());
    let shutdown = Shutdown::listen_for_signals();
    let options = DispatchOptions {
        sender: config.sender_name.clone(),
        limit: cli.limit,
        max_send_attempts: config.retry.max_send_attempts,
        retry_backoff: Duration::seconds(config.retry.retry_backoff_seconds as i64),
        dry_run: cli.dry_run,
    };

    let summary: RunSummary = if cli.dry_run {
        let mut ledger = DryRunLedger::new(store.record().clone());
        let transport = DryRunTransport::new();
        let clock = SimulatedClock::starting_at(Utc::now());

        Dispatcher::new(renderer, scheduler, &mut ledger, &transport, &clock, shutdown, options)
            .run(&recipients)
            .await?
    } else {
        let transport = GmailTransport::new(&config.gmail, &config.paths.token)?;

        Dispatcher::new(renderer, scheduler, store, &transport, &SystemClock, shutdown, options)
            .run(&recipients)
            .await?
    };

    tracing::info!(outcome = %summary.outcome, "mailer_finished");
    Ok(())
}
