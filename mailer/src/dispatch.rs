//! The campaign dispatch loop.
//!
//! Recipients are handled strictly one at a time: skip if already settled,
//! render, wait for the scheduler, send, commit. A send is committed to the
//! ledger before the next recipient is looked at, and interrupts are only
//! honored at waits and between recipients.

use std::fmt;

use chrono::Duration;
use rand::Rng;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::error::{MailerError, Result};
use crate::progress::ProgressLedger;
use crate::recipients::Recipient;
use crate::schedule::{Action, Scheduler};
use crate::shutdown::Shutdown;
use crate::template::spintax::Chooser;
use crate::template::{RenderedEmail, Renderer};
use crate::transport::{Transport, TransportError};

/// Knobs for one run of the loop.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// `From` header value
    pub sender: String,
    /// Stop after this many successful sends in this run
    pub limit: Option<usize>,
    /// Attempts per recipient for transient failures, at least 1
    pub max_send_attempts: u32,
    /// Pause between transient retries
    pub retry_backoff: Duration,
    /// Only changes log fields; the caller picks the dry-run components
    pub dry_run: bool,
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every recipient is sent or permanently failed
    Completed,
    /// `--limit` reached
    LimitReached,
    /// Daily limit reached; rerun tomorrow
    DailyLimitReached,
    /// Provider quota hit; rerun later
    QuotaExceeded,
    /// SIGINT/SIGTERM
    Interrupted,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::LimitReached => "limit_reached",
            RunOutcome::DailyLimitReached => "daily_limit_reached",
            RunOutcome::QuotaExceeded => "quota_exceeded",
            RunOutcome::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    /// Sent during this run
    pub sent: usize,
    /// Permanently rejected during this run
    pub rejected: usize,
    /// Already sent or permanently failed before this run
    pub skipped: usize,
    /// Part of `skipped` that was already sent
    pub skipped_already_sent: usize,
    /// Part of `skipped` that was permanently rejected earlier
    pub skipped_failed: usize,
    /// Recipients with a non-permanent failure from an earlier run, retried
    pub retried_failures: usize,
    /// Sent across all runs of the campaign
    pub total_sent: usize,
    /// Failed across all runs of the campaign
    pub total_failed: usize,
    /// Recipients still neither sent nor failed
    pub remaining: usize,
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    sent: usize,
    rejected: usize,
    skipped_already_sent: usize,
    skipped_failed: usize,
    retried_failures: usize,
}

enum Slot {
    Ready,
    StopForToday,
    Interrupted,
}

enum Delivery {
    Sent,
    Rejected(String),
    QuotaExceeded(String),
    Interrupted,
}

pub struct Dispatcher<'a, C, R> {
    renderer: Renderer<C>,
    scheduler: Scheduler<R>,
    ledger: &'a mut dyn ProgressLedger,
    transport: &'a dyn Transport,
    clock: &'a dyn Clock,
    shutdown: Shutdown,
    options: DispatchOptions,
    tally: Tally,
}

impl<'a, C: Chooser, R: Rng> Dispatcher<'a, C, R> {
    pub fn new(
        renderer: Renderer<C>,
        scheduler: Scheduler<R>,
        ledger: &'a mut dyn ProgressLedger,
        transport: &'a dyn Transport,
        clock: &'a dyn Clock,
        shutdown: Shutdown,
        options: DispatchOptions,
    ) -> Self {
        Self {
            renderer,
            scheduler,
            ledger,
            transport,
            clock,
            shutdown,
            options,
            tally: Tally::default(),
        }
    }

    /// Work through `recipients` in order until done, stopped or failed.
    ///
    /// Returns `Err` only for fatal conditions: expired authorization,
    /// exhausted transient retries, or a progress write failure.
    pub async fn run(&mut self, recipients: &[Recipient]) -> Result<RunSummary> {
        let config = self.scheduler.config();
        info!(
            recipients = recipients.len(),
            already_sent = self.ledger.record().sent.len(),
            dry_run = self.options.dry_run,
            limit = ?self.options.limit,
            emails_per_hour = config.emails_per_hour,
            daily_limit = config.daily_limit,
            base_interval_seconds = config.base_interval_seconds,
            "dispatch_started"
        );

        let outcome = match self.process_all(recipients).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let record = self.ledger.record();
                error!(
                    error = %e,
                    sent_this_run = self.tally.sent,
                    total_sent = record.sent.len(),
                    "dispatch_fatal"
                );
                return Err(e);
            }
        };

        let summary = self.summarize(outcome, recipients);
        info!(
            outcome = %summary.outcome,
            sent = summary.sent,
            rejected = summary.rejected,
            skipped = summary.skipped,
            skipped_already_sent = summary.skipped_already_sent,
            skipped_failed = summary.skipped_failed,
            retried_failures = summary.retried_failures,
            total_sent = summary.total_sent,
            total_failed = summary.total_failed,
            remaining = summary.remaining,
            dry_run = self.options.dry_run,
            "campaign_summary"
        );
        Ok(summary)
    }

    async fn process_all(&mut self, recipients: &[Recipient]) -> Result<RunOutcome> {
        for recipient in recipients {
            if self.shutdown.is_triggered() {
                info!(sent_this_run = self.tally.sent, "dispatch_interrupted");
                return Ok(RunOutcome::Interrupted);
            }

            let identity = recipient.email.as_str();
            let record = self.ledger.record();
            if record.is_sent(identity) {
                info!(recipient = %identity, reason = "already_sent", "dispatch_skip");
                self.tally.skipped_already_sent += 1;
                continue;
            }
            if record.is_failed(identity) {
                let reason = record.failed.get(identity).map(String::as_str).unwrap_or_default();
                info!(
                    recipient = %identity,
                    reason = "permanently_rejected",
                    rejection = %reason,
                    "dispatch_skip"
                );
                self.tally.skipped_failed += 1;
                continue;
            }
            if let Some(previous) = record.retryable_failure(identity) {
                warn!(recipient = %identity, previous_error = %previous, "dispatch_retrying_earlier_failure");
                self.tally.retried_failures += 1;
            }

            if let Some(limit) = self.options.limit {
                if self.tally.sent >= limit {
                    info!(limit = limit, "dispatch_limit_reached");
                    return Ok(RunOutcome::LimitReached);
                }
            }

            let email = self.renderer.render(recipient);

            match self.wait_for_slot(identity).await {
                Slot::Ready => {}
                Slot::StopForToday => return Ok(RunOutcome::DailyLimitReached),
                Slot::Interrupted => {
                    info!(sent_this_run = self.tally.sent, "dispatch_interrupted");
                    return Ok(RunOutcome::Interrupted);
                }
            }

            match self.deliver(&email).await? {
                Delivery::Sent => {
                    let at = self.clock.now();
                    self.ledger.record_sent(identity, at)?;
                    self.tally.sent += 1;

                    let record = self.ledger.record();
                    info!(
                        recipient = %identity,
                        subject = %email.subject,
                        sent_at = %at,
                        daily_count = record.daily_count,
                        total_sent = record.sent.len(),
                        dry_run = self.options.dry_run,
                        "dispatch_sent"
                    );
                }
                Delivery::Rejected(reason) => {
                    let at = self.clock.now();
                    self.ledger.record_failed(identity, &reason, at)?;
                    self.tally.rejected += 1;
                    error!(recipient = %identity, reason = %reason, "dispatch_rejected");
                }
                Delivery::QuotaExceeded(reason) => {
                    warn!(
                        recipient = %identity,
                        reason = %reason,
                        sent_this_run = self.tally.sent,
                        "dispatch_quota_exceeded"
                    );
                    return Ok(RunOutcome::QuotaExceeded);
                }
                Delivery::Interrupted => {
                    info!(sent_this_run = self.tally.sent, "dispatch_interrupted");
                    return Ok(RunOutcome::Interrupted);
                }
            }
        }

        Ok(RunOutcome::Completed)
    }

    /// Poll the scheduler until it allows a send, sleeping in between.
    async fn wait_for_slot(&mut self, identity: &str) -> Slot {
        loop {
            let now = self.clock.now();
            match self.scheduler.next_action(self.ledger.record(), now) {
                Action::Send => return Slot::Ready,
                Action::StopForToday => {
                    info!(
                        daily_count = self.ledger.record().daily_count_on(now.date_naive()),
                        daily_limit = self.scheduler.config().daily_limit,
                        "dispatch_daily_limit_reached"
                    );
                    return Slot::StopForToday;
                }
                Action::WaitUntil(until) => {
                    info!(
                        recipient = %identity,
                        until = %until,
                        wait_seconds = (until - now).num_milliseconds() as f64 / 1000.0,
                        "dispatch_waiting"
                    );
                    tokio::select! {
                        biased;
                        _ = self.shutdown.wait() => return Slot::Interrupted,
                        _ = self.clock.sleep_until(until) => {}
                    }
                }
            }
        }
    }

    /// Send one email, retrying transient failures with a fixed backoff.
    async fn deliver(&self, email: &RenderedEmail) -> Result<Delivery> {
        let max_attempts = self.options.max_send_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.transport.send(email, &self.options.sender).await {
                Ok(()) => return Ok(Delivery::Sent),
                Err(TransportError::Transient(reason)) if attempt < max_attempts => {
                    warn!(
                        recipient = %email.to.email,
                        attempt = attempt,
                        max_attempts = max_attempts,
                        error = %reason,
                        retry_in_seconds = self.options.retry_backoff.num_seconds(),
                        "dispatch_send_retrying"
                    );
                    let until = self.clock.now() + self.options.retry_backoff;
                    tokio::select! {
                        biased;
                        _ = self.shutdown.wait() => return Ok(Delivery::Interrupted),
                        _ = self.clock.sleep_until(until) => {}
                    }
                }
                Err(TransportError::QuotaExceeded(reason)) => return Ok(Delivery::QuotaExceeded(reason)),
                Err(TransportError::PermanentRejection(reason)) => return Ok(Delivery::Rejected(reason)),
                Err(e) => return Err(MailerError::Transport(e)),
            }
        }
    }

    fn summarize(&self, outcome: RunOutcome, recipients: &[Recipient]) -> RunSummary {
        let record = self.ledger.record();
        let remaining = recipients
            .iter()
            .filter(|r| !record.is_sent(&r.email) && !record.is_failed(&r.email))
            .count();

        RunSummary {
            outcome,
            sent: self.tally.sent,
            rejected: self.tally.rejected,
            skipped: self.tally.skipped_already_sent + self.tally.skipped_failed,
            skipped_already_sent: self.tally.skipped_already_sent,
            skipped_failed: self.tally.skipped_failed,
            retried_failures: self.tally.retried_failures,
            total_sent: record.sent.len(),
            total_failed: record.failed_permanent.len(),
            remaining,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeSet, VecDeque};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use crate::clock::SimulatedClock;
    use crate::config::RateLimitConfig;
    use crate::progress::{DryRunLedger, ProgressRecord, ProgressStore};
    use crate::template::spintax::FnChooser;
    use crate::template::Template;
    use crate::transport::DryRunTransport;

    /// Transport that replays scripted results, then succeeds.
    #[derive(Default)]
    struct ScriptedTransport {
        script: Mutex<VecDeque<std::result::Result<(), TransportError>>>,
        delivered: Mutex<Vec<String>>,
        trigger_on_send: Option<Shutdown>,
    }

    impl ScriptedTransport {
        fn with_script(script: Vec<std::result::Result<(), TransportError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                ..Default::default()
            }
        }

        fn delivered(&self) -> Vec<String> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, email: &RenderedEmail, _sender: &str) -> std::result::Result<(), TransportError> {
            if let Some(shutdown) = &self.trigger_on_send {
                shutdown.trigger();
            }
            let result = self.script.lock().unwrap().pop_front().unwrap_or(Ok(()));
            if result.is_ok() {
                self.delivered.lock().unwrap().push(email.to.email.clone());
            }
            result
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    fn limits(per_hour: u32, base: u64, daily: u32) -> RateLimitConfig {
        RateLimitConfig {
            emails_per_hour: per_hour,
            base_interval_seconds: base,
            jitter_range_min: 0,
            jitter_range_max: 0,
            daily_limit: daily,
        }
    }

    fn recipients(emails: &[&str]) -> Vec<Recipient> {
        emails
            .iter()
            .map(|e| Recipient::new("test", e, None).unwrap())
            .collect()
    }

    fn options(limit: Option<usize>) -> DispatchOptions {
        DispatchOptions {
            sender: "Jane from Acme".to_string(),
            limit,
            max_send_attempts: 3,
            retry_backoff: Duration::seconds(30),
            dry_run: false,
        }
    }

    async fn run(
        config: RateLimitConfig,
        ledger: &mut dyn ProgressLedger,
        transport: &dyn Transport,
        clock: &SimulatedClock,
        shutdown: Shutdown,
        opts: DispatchOptions,
        list: &[Recipient],
    ) -> Result<RunSummary> {
        let template = Template::parse("SUBJECT: Hi {{first_name}}\n---\n{Hello|Hey} {{first_name}}").unwrap();
        let renderer = Renderer::new(template, BTreeSet::new(), FnChooser(|_: usize| 0));
        let scheduler = Scheduler::with_rng(config, StdRng::seed_from_u64(7));

        let mut dispatcher = Dispatcher::new(renderer, scheduler, ledger, transport, clock, shutdown, opts);
        dispatcher.run(list).await
    }

    #[tokio::test]
    async fn test_resume_skips_already_sent() {
        let mut record = ProgressRecord::new("test");
        record.apply_sent("a@x.com", start() - Duration::days(1));
        let mut ledger = DryRunLedger::new(record);
        let transport = ScriptedTransport::default();
        let clock = SimulatedClock::starting_at(start());

        let summary = run(
            limits(0, 0, 100),
            &mut ledger,
            &transport,
            &clock,
            Shutdown::new(),
            options(None),
            &recipients(&["a@x.com", "b@x.com"]),
        )
        .await
        .unwrap();

        assert_eq!(transport.delivered(), vec!["b@x.com"]);
        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert_eq!(summary.sent, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.skipped_already_sent, 1);
        assert_eq!(summary.total_sent, 2);
        assert_eq!(summary.remaining, 0);
    }

    #[tokio::test]
    async fn test_daily_limit_scenario() {
        let mut ledger = DryRunLedger::new(ProgressRecord::new("test"));
        let transport = ScriptedTransport::default();
        let clock = SimulatedClock::starting_at(start());
        let list = recipients(&["r1@x.com", "r2@x.com", "r3@x.com", "r4@x.com", "r5@x.com"]);

        let summary = run(
            limits(2, 1, 3),
            &mut ledger,
            &transport,
            &clock,
            Shutdown::new(),
            options(None),
            &list,
        )
        .await
        .unwrap();

        assert_eq!(summary.outcome, RunOutcome::DailyLimitReached);
        assert_eq!(transport.delivered(), vec!["r1@x.com", "r2@x.com", "r3@x.com"]);

        let record = ledger.record();
        assert_eq!(record.daily_count, 3);
        assert_eq!(
            record.sent.iter().cloned().collect::<Vec<_>>(),
            vec!["r1@x.com", "r2@x.com", "r3@x.com"]
        );
        // Third send waited for the oldest of the first two to leave the hour
        assert_eq!(record.last_send_at, Some(start() + Duration::hours(1)));
        assert_eq!(summary.remaining, 2);
    }

    #[tokio::test]
    async fn test_limit_counts_new_sends_only() {
        let mut record = ProgressRecord::new("test");
        record.apply_sent("a@x.com", start() - Duration::days(1));
        let mut ledger = DryRunLedger::new(record);
        let transport = ScriptedTransport::default();
        let clock = SimulatedClock::starting_at(start());

        let summary = run(
            limits(0, 0, 100),
            &mut ledger,
            &transport,
            &clock,
            Shutdown::new(),
            options(Some(2)),
            &recipients(&["a@x.com", "b@x.com", "c@x.com", "d@x.com"]),
        )
        .await
        .unwrap();

        assert_eq!(summary.outcome, RunOutcome::LimitReached);
        assert_eq!(transport.delivered(), vec!["b@x.com", "c@x.com"]);
    }

    #[tokio::test]
    async fn test_quota_halts_gracefully() {
        let mut ledger = DryRunLedger::new(ProgressRecord::new("test"));
        let transport = ScriptedTransport::with_script(vec![
            Ok(()),
            Err(TransportError::QuotaExceeded("Daily Limit Exceeded".to_string())),
        ]);
        let clock = SimulatedClock::starting_at(start());

        let summary = run(
            limits(0, 0, 100),
            &mut ledger,
            &transport,
            &clock,
            Shutdown::new(),
            options(None),
            &recipients(&["a@x.com", "b@x.com", "c@x.com"]),
        )
        .await
        .unwrap();

        assert_eq!(summary.outcome, RunOutcome::QuotaExceeded);
        assert_eq!(summary.sent, 1);
        assert!(ledger.record().is_sent("a@x.com"));
        assert!(!ledger.record().is_sent("b@x.com"));
        assert!(!ledger.record().is_failed("b@x.com"));
    }

    #[tokio::test]
    async fn test_auth_expired_is_fatal() {
        let mut ledger = DryRunLedger::new(ProgressRecord::new("test"));
        let transport = ScriptedTransport::with_script(vec![
            Ok(()),
            Err(TransportError::AuthExpired("Invalid Credentials".to_string())),
        ]);
        let clock = SimulatedClock::starting_at(start());

        let err = run(
            limits(0, 0, 100),
            &mut ledger,
            &transport,
            &clock,
            Shutdown::new(),
            options(None),
            &recipients(&["a@x.com", "b@x.com"]),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, MailerError::Transport(TransportError::AuthExpired(_))));
        assert_eq!(ledger.record().sent.len(), 1);
    }

    #[tokio::test]
    async fn test_permanent_rejection_recorded_and_continues() {
        let mut ledger = DryRunLedger::new(ProgressRecord::new("test"));
        let transport = ScriptedTransport::with_script(vec![Err(TransportError::PermanentRejection(
            "Invalid To header".to_string(),
        ))]);
        let clock = SimulatedClock::starting_at(start());

        let summary = run(
            limits(0, 0, 100),
            &mut ledger,
            &transport,
            &clock,
            Shutdown::new(),
            options(None),
            &recipients(&["bad@x.com", "good@x.com"]),
        )
        .await
        .unwrap();

        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.sent, 1);
        let record = ledger.record();
        assert_eq!(record.failed.get("bad@x.com").map(String::as_str), Some("Invalid To header"));
        assert!(!record.is_sent("bad@x.com"));
        assert_eq!(record.daily_count, 1);
    }

    #[tokio::test]
    async fn test_rejection_still_paces_next_send() {
        let mut ledger = DryRunLedger::new(ProgressRecord::new("test"));
        let transport = ScriptedTransport::with_script(vec![
            Ok(()),
            Err(TransportError::PermanentRejection("Invalid To header".to_string())),
        ]);
        let clock = SimulatedClock::starting_at(start());

        let summary = run(
            limits(0, 180, 100),
            &mut ledger,
            &transport,
            &clock,
            Shutdown::new(),
            options(None),
            &recipients(&["a@x.com", "b@x.com", "c@x.com"]),
        )
        .await
        .unwrap();

        assert_eq!(summary.sent, 2);
        assert_eq!(summary.rejected, 1);
        let record = ledger.record();
        // a at +0s, b rejected at +180s, c one full interval later
        assert_eq!(record.last_attempt_at, Some(start() + Duration::seconds(360)));
        assert_eq!(record.last_send_at, Some(start() + Duration::seconds(360)));
        assert_eq!(record.recent_sends, vec![start(), start() + Duration::seconds(360)]);
        assert_eq!(record.daily_count, 2);
    }

    #[tokio::test]
    async fn test_earlier_non_permanent_failure_is_retried() {
        let mut record = ProgressRecord::new("test");
        record.failed.insert(
            "b@x.com".to_string(),
            "Gmail API error: <HttpError 429 Too Many Requests>".to_string(),
        );
        record.apply_failed("gone@x.com", "Invalid To header", start() - Duration::days(1));
        let mut ledger = DryRunLedger::new(record);
        let transport = ScriptedTransport::default();
        let clock = SimulatedClock::starting_at(start());

        let summary = run(
            limits(0, 0, 100),
            &mut ledger,
            &transport,
            &clock,
            Shutdown::new(),
            options(None),
            &recipients(&["b@x.com", "gone@x.com"]),
        )
        .await
        .unwrap();

        assert_eq!(transport.delivered(), vec!["b@x.com"]);
        assert_eq!(summary.retried_failures, 1);
        assert_eq!(summary.skipped_failed, 1);
        assert_eq!(summary.total_failed, 1);
        assert!(ledger.record().is_sent("b@x.com"));
        assert!(!ledger.record().failed.contains_key("b@x.com"));
    }

    #[tokio::test]
    async fn test_transient_retried_then_sent() {
        let mut ledger = DryRunLedger::new(ProgressRecord::new("test"));
        let transport = ScriptedTransport::with_script(vec![
            Err(TransportError::Transient("timeout".to_string())),
            Err(TransportError::Transient("503".to_string())),
        ]);
        let clock = SimulatedClock::starting_at(start());

        let summary = run(
            limits(0, 0, 100),
            &mut ledger,
            &transport,
            &clock,
            Shutdown::new(),
            options(None),
            &recipients(&["a@x.com"]),
        )
        .await
        .unwrap();

        assert_eq!(summary.sent, 1);
        assert_eq!(clock.now(), start() + Duration::seconds(60));
    }

    #[tokio::test]
    async fn test_transient_exhausted_is_fatal() {
        let mut ledger = DryRunLedger::new(ProgressRecord::new("test"));
        let transport = ScriptedTransport::with_script(vec![
            Err(TransportError::Transient("timeout".to_string())),
            Err(TransportError::Transient("timeout".to_string())),
            Err(TransportError::Transient("timeout".to_string())),
        ]);
        let clock = SimulatedClock::starting_at(start());

        let err = run(
            limits(0, 0, 100),
            &mut ledger,
            &transport,
            &clock,
            Shutdown::new(),
            options(None),
            &recipients(&["a@x.com", "b@x.com"]),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, MailerError::Transport(TransportError::Transient(_))));
        assert!(ledger.record().sent.is_empty());
        assert!(transport.delivered().is_empty());
    }

    #[tokio::test]
    async fn test_interrupt_honored_after_commit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.json");
        let mut store = ProgressStore::open(&path, "test").unwrap();
        store.load().unwrap();

        let shutdown = Shutdown::new();
        let transport = ScriptedTransport {
            trigger_on_send: Some(shutdown.clone()),
            ..Default::default()
        };
        let clock = SimulatedClock::starting_at(start());

        let summary = run(
            limits(0, 0, 100),
            &mut store,
            &transport,
            &clock,
            shutdown,
            options(None),
            &recipients(&["a@x.com", "b@x.com"]),
        )
        .await
        .unwrap();

        assert_eq!(summary.outcome, RunOutcome::Interrupted);
        assert_eq!(summary.sent, 1);

        let saved: ProgressRecord = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(saved.is_sent("a@x.com"));
        assert!(!saved.is_sent("b@x.com"));
    }

    /// Clock whose first sleep raises the shutdown flag and never wakes.
    struct InterruptingClock {
        inner: SimulatedClock,
        shutdown: Shutdown,
    }

    #[async_trait]
    impl Clock for InterruptingClock {
        fn now(&self) -> DateTime<Utc> {
            self.inner.now()
        }

        async fn sleep_until(&self, _deadline: DateTime<Utc>) {
            self.shutdown.trigger();
            std::future::pending::<()>().await;
        }
    }

    #[tokio::test]
    async fn test_interrupt_during_wait() {
        let mut record = ProgressRecord::new("test");
        record.apply_sent("a@x.com", start());
        let mut ledger = DryRunLedger::new(record);
        let shutdown = Shutdown::new();
        let transport = ScriptedTransport::default();
        let clock = InterruptingClock {
            inner: SimulatedClock::starting_at(start()),
            shutdown: shutdown.clone(),
        };

        let template = Template::parse("SUBJECT: Hi\n---\nBody").unwrap();
        let mut dispatcher = Dispatcher::new(
            Renderer::new(template, BTreeSet::new(), FnChooser(|_: usize| 0)),
            Scheduler::with_rng(limits(0, 180, 100), StdRng::seed_from_u64(7)),
            &mut ledger,
            &transport,
            &clock,
            shutdown,
            options(None),
        );
        let summary = dispatcher.run(&recipients(&["a@x.com", "b@x.com"])).await.unwrap();

        assert_eq!(summary.outcome, RunOutcome::Interrupted);
        assert!(transport.delivered().is_empty());
        assert_eq!(summary.remaining, 1);
    }

    #[tokio::test]
    async fn test_dry_run_leaves_progress_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.json");
        std::fs::write(&path, r#"{"campaign": "test", "sent": ["a@x.com"], "daily_count": 0}"#).unwrap();
        let before = std::fs::read_to_string(&path).unwrap();

        let mut store = ProgressStore::open(&path, "test").unwrap();
        let mut ledger = DryRunLedger::new(store.load().unwrap().clone());
        let transport = DryRunTransport::new();
        let clock = SimulatedClock::starting_at(start());
        let mut opts = options(None);
        opts.dry_run = true;

        let summary = run(
            limits(20, 180, 100),
            &mut ledger,
            &transport,
            &clock,
            Shutdown::new(),
            opts,
            &recipients(&["a@x.com", "b@x.com", "c@x.com"]),
        )
        .await
        .unwrap();

        assert_eq!(summary.sent, 2);
        assert_eq!(transport.previewed(), 2);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
        // The simulated clock walked through the planned interval
        assert_eq!(clock.now(), start() + Duration::seconds(180));
    }
}
