//! Send-rate gating.
//!
//! The scheduler never sleeps and never reads the wall clock. Callers hand it
//! the current [`ProgressRecord`] and `now` and get back a decision, which
//! keeps it testable with synthetic timestamps.
//!
//! Two gates apply to every send after the first:
//!
//! - interval: last provider call (sent or rejected) + base_interval + jitter
//! - hourly cap: a rolling 60-minute window over `recent_sends`
//!
//! The later of the two wins. The daily limit is checked first and ends the
//! session for the day.

use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::RateLimitConfig;
use crate::progress::{hour_window, ProgressRecord};

/// What to do about the next pending recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Send,
    WaitUntil(DateTime<Utc>),
    StopForToday,
}

/// Interval target drawn for the send following `after`.
#[derive(Debug, Clone, Copy)]
struct PendingGate {
    after: DateTime<Utc>,
    not_before: DateTime<Utc>,
}

/// Rate-limit decisions for one dispatcher instance.
pub struct Scheduler<R = StdRng> {
    config: RateLimitConfig,
    rng: R,
    pending: Option<PendingGate>,
}

impl Scheduler<StdRng> {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }
}

impl<R: Rng> Scheduler<R> {
    pub fn with_rng(config: RateLimitConfig, rng: R) -> Self {
        Self {
            config,
            rng,
            pending: None,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Decide whether the next recipient may be sent at `now`.
    pub fn next_action(&mut self, record: &ProgressRecord, now: DateTime<Utc>) -> Action {
        let limit = self.config.daily_limit;
        if limit == 0 || record.daily_count_on(now.date_naive()) >= limit {
            return Action::StopForToday;
        }

        let interval = record.last_attempt().map(|last| self.interval_gate(last));
        let hourly = self.hour_gate(record, now);

        match interval.max(hourly) {
            Some(allowed) if now < allowed => Action::WaitUntil(allowed),
            _ => Action::Send,
        }
    }

    /// Interval target for the call after `last`, drawn once and reused
    /// until a newer call replaces `last`.
    fn interval_gate(&mut self, last: DateTime<Utc>) -> DateTime<Utc> {
        if let Some(gate) = self.pending.filter(|g| g.after == last) {
            return gate.not_before;
        }

        let not_before = last + Duration::seconds(self.config.base_interval_seconds as i64) + self.draw_jitter();
        self.pending = Some(PendingGate {
            after: last,
            not_before,
        });
        not_before
    }

    fn draw_jitter(&mut self) -> Duration {
        let min_ms = self.config.jitter_range_min.saturating_mul(1000);
        let max_ms = self.config.jitter_range_max.saturating_mul(1000).max(min_ms);
        Duration::milliseconds(self.rng.gen_range(min_ms..=max_ms) as i64)
    }

    /// Earliest time the rolling hour has room for one more send, if it is full.
    fn hour_gate(&self, record: &ProgressRecord, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let cap = self.config.emails_per_hour as usize;
        if cap == 0 {
            return None;
        }

        let window = record.sends_in_window(now);
        if window.len() < cap {
            return None;
        }

        // Enough of the oldest sends must age out to leave cap - 1 in the window.
        Some(window[window.len() - cap] + hour_window())
    }
}
