//! Durable campaign progress.
//!
//! The record is a human-readable JSON snapshot rewritten after every send
//! (temp file, fsync, rename), so a crash never leaves a torn file behind.
//! An exclusive lock on a sidecar `.lock` file keeps a second instance from
//! writing the same record.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{MailerError, Result};
use crate::recipients::normalize_email;

/// Length of the rolling window used for the hourly cap.
pub fn hour_window() -> Duration {
    Duration::hours(1)
}

/// Persisted campaign state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    #[serde(default)]
    pub campaign: String,

    /// Identities confirmed sent
    #[serde(default)]
    pub sent: BTreeSet<String>,

    /// Failure reasons by identity. Older files wrote every error here,
    /// retryable or not, so an entry alone does not settle a recipient.
    #[serde(default)]
    pub failed: BTreeMap<String, String>,

    /// Identities the transport rejected for good; skipped on resume
    #[serde(default)]
    pub failed_permanent: BTreeSet<String>,

    /// Sends on `day_key`
    #[serde(default)]
    pub daily_count: u32,

    /// UTC day that `daily_count` belongs to
    #[serde(default, rename = "daily_date")]
    pub day_key: Option<NaiveDate>,

    #[serde(default)]
    pub last_send_at: Option<DateTime<Utc>>,

    /// Last provider call of any outcome; paces sends after a rejection
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,

    /// Send times inside the trailing hour, oldest first
    #[serde(default)]
    pub recent_sends: Vec<DateTime<Utc>>,

    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl ProgressRecord {
    pub fn new(campaign: impl Into<String>) -> Self {
        Self {
            campaign: campaign.into(),
            sent: BTreeSet::new(),
            failed: BTreeMap::new(),
            failed_permanent: BTreeSet::new(),
            daily_count: 0,
            day_key: None,
            last_send_at: None,
            last_attempt_at: None,
            recent_sends: Vec::new(),
            last_updated: None,
        }
    }

    pub fn is_sent(&self, identity: &str) -> bool {
        self.sent.contains(identity)
    }

    /// Permanently rejected; never retried.
    pub fn is_failed(&self, identity: &str) -> bool {
        self.failed_permanent.contains(identity)
    }

    /// Reason stored for a failure that was not marked permanent, as older
    /// versions recorded quota and network errors. Such recipients are retried.
    pub fn retryable_failure(&self, identity: &str) -> Option<&str> {
        if self.is_failed(identity) {
            return None;
        }
        self.failed.get(identity).map(String::as_str)
    }

    /// Time of the most recent provider call, successful or not.
    pub fn last_attempt(&self) -> Option<DateTime<Utc>> {
        self.last_send_at.max(self.last_attempt_at)
    }

    /// Sends counted against `today`. A stale `day_key` counts as zero.
    pub fn daily_count_on(&self, today: NaiveDate) -> u32 {
        match self.day_key {
            Some(day) if day == today => self.daily_count,
            _ => 0,
        }
    }

    /// Send times within the hour ending at `now`, oldest first.
    pub fn sends_in_window(&self, now: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        let cutoff = now - hour_window();
        let mut in_window: Vec<_> = self
            .recent_sends
            .iter()
            .copied()
            .filter(|t| *t > cutoff && *t <= now)
            .collect();
        in_window.sort();
        in_window
    }

    /// Apply a confirmed send.
    pub fn apply_sent(&mut self, identity: &str, at: DateTime<Utc>) {
        self.sent.insert(identity.to_string());
        self.failed.remove(identity);

        let today = at.date_naive();
        if self.day_key == Some(today) {
            self.daily_count += 1;
        } else {
            self.day_key = Some(today);
            self.daily_count = 1;
        }

        self.last_send_at = Some(at);
        self.last_attempt_at = self.last_attempt_at.max(Some(at));

        let cutoff = at - hour_window();
        self.recent_sends.retain(|t| *t > cutoff);
        self.recent_sends.push(at);
    }

    /// Apply a permanent rejection of a send attempted at `at`.
    ///
    /// Not counted against the daily or hourly limits, but it does move
    /// the interval gate.
    pub fn apply_failed(&mut self, identity: &str, reason: &str, at: DateTime<Utc>) {
        self.failed.insert(identity.to_string(), reason.to_string());
        self.failed_permanent.insert(identity.to_string());
        self.last_attempt_at = self.last_attempt_at.max(Some(at));
    }

    /// Lower-case identities written by older versions.
    fn normalize(&mut self) {
        self.sent = self.sent.iter().map(|e| normalize_email(e)).collect();
        self.failed = std::mem::take(&mut self.failed)
            .into_iter()
            .map(|(e, reason)| (normalize_email(&e), reason))
            .collect();
        self.failed_permanent = self.failed_permanent.iter().map(|e| normalize_email(e)).collect();
        self.recent_sends.sort();
    }
}

/// Where the dispatch loop commits outcomes.
pub trait ProgressLedger {
    fn record(&self) -> &ProgressRecord;

    fn record_sent(&mut self, identity: &str, at: DateTime<Utc>) -> Result<()>;

    fn record_failed(&mut self, identity: &str, reason: &str, at: DateTime<Utc>) -> Result<()>;
}

/// File-backed progress store holding an exclusive lock while open.
#[derive(Debug)]
pub struct ProgressStore {
    path: PathBuf,
    campaign: String,
    record: ProgressRecord,
    _lock: File,
}

impl ProgressStore {
    /// Lock and load the progress file at `path`.
    pub fn open(path: impl Into<PathBuf>, campaign: &str) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| MailerError::io(parent, e))?;
        }

        let lock_path = sidecar(&path, "lock");
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| MailerError::io(&lock_path, e))?;
        lock.try_lock_exclusive()
            .map_err(|_| MailerError::ProgressLocked { path: path.clone() })?;

        let mut store = Self {
            path,
            campaign: campaign.to_string(),
            record: ProgressRecord::new(campaign),
            _lock: lock,
        };
        store.load()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the record from disk. A missing file is an empty record.
    pub fn load(&mut self) -> Result<&ProgressRecord> {
        self.record = read_record(&self.path, &self.campaign)?;

        info!(
            path = %self.path.display(),
            sent = self.record.sent.len(),
            failed = self.record.failed.len(),
            daily_count = self.record.daily_count,
            day_key = ?self.record.day_key,
            "progress_loaded"
        );

        Ok(&self.record)
    }

    /// Delete persisted progress.
    pub fn reset(&mut self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(MailerError::io(&self.path, e)),
        }
        self.record = ProgressRecord::new(self.campaign.clone());

        warn!(path = %self.path.display(), "progress_reset");
        Ok(())
    }

    /// Apply `change` to a copy, persist it, then adopt it.
    fn commit(&mut self, change: impl FnOnce(&mut ProgressRecord)) -> Result<()> {
        let mut next = self.record.clone();
        change(&mut next);
        next.last_updated = Some(Utc::now());
        write_atomic(&self.path, &next)?;
        self.record = next;
        Ok(())
    }
}

impl ProgressLedger for ProgressStore {
    fn record(&self) -> &ProgressRecord {
        &self.record
    }

    fn record_sent(&mut self, identity: &str, at: DateTime<Utc>) -> Result<()> {
        self.commit(|r| r.apply_sent(identity, at))
    }

    fn record_failed(&mut self, identity: &str, reason: &str, at: DateTime<Utc>) -> Result<()> {
        self.commit(|r| r.apply_failed(identity, reason, at))
    }
}

/// In-memory ledger for dry runs; nothing touches disk.
#[derive(Debug, Clone)]
pub struct DryRunLedger {
    record: ProgressRecord,
}

impl DryRunLedger {
    pub fn new(record: ProgressRecord) -> Self {
        Self { record }
    }
}

impl ProgressLedger for DryRunLedger {
    fn record(&self) -> &ProgressRecord {
        &self.record
    }

    fn record_sent(&mut self, identity: &str, at: DateTime<Utc>) -> Result<()> {
        self.record.apply_sent(identity, at);
        Ok(())
    }

    fn record_failed(&mut self, identity: &str, reason: &str, at: DateTime<Utc>) -> Result<()> {
        self.record.apply_failed(identity, reason, at);
        Ok(())
    }
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

fn read_record(path: &Path, campaign: &str) -> Result<ProgressRecord> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(ProgressRecord::new(campaign));
        }
        Err(e) => {
            return Err(MailerError::ProgressStoreCorrupt {
                path: path.to_path_buf(),
                reason: format!("unreadable: {}", e),
            })
        }
    };

    let mut record: ProgressRecord =
        serde_json::from_str(&raw).map_err(|e| MailerError::ProgressStoreCorrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    if record.campaign.is_empty() {
        record.campaign = campaign.to_string();
    }
    record.normalize();
    Ok(record)
}

/// Write `record` to `path` without ever exposing a partial file.
pub(crate) fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let payload = serde_json::to_vec_pretty(value).map_err(|e| MailerError::io(path, e.into()))?;

    let tmp = sidecar(path, "tmp");
    let mut file = File::create(&tmp).map_err(|e| MailerError::io(&tmp, e))?;
    file.write_all(&payload)
        .and_then(|_| file.sync_all())
        .map_err(|e| MailerError::io(&tmp, e))?;
    drop(file);

    fs::rename(&tmp, path).map_err(|e| MailerError::io(path, e))?;
    sync_parent(path)
}

/// Flush the directory entry so the rename itself survives a power loss.
#[cfg(unix)]
fn sync_parent(path: &Path) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    File::open(parent)
        .and_then(|dir| dir.sync_all())
        .map_err(|e| MailerError::io(parent, e))
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> Result<()> {
    Ok(())
}
