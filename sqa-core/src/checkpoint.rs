//! Run directory layout and JSONL checkpointing. Every finished query is
//! appended to `audit.jsonl` and flushed immediately, so a crashed run can
//! resume by scanning the latest run directory for completed query ids.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

use crate::browser::ErrorKind;
use crate::model::AuditRecord;

const AUDIT_LOG_NAME: &str = "audit.jsonl";
const FAILURES_LOG_NAME: &str = "failures.jsonl";
const SCREENSHOTS_DIR: &str = "screenshots";
const HTML_DIR: &str = "html_snapshots";

pub type CheckpointResult<T> = Result<T, CheckpointError>;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Checkpoint encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// File layout of one audit run under `{out_dir}/{site_host}/{timestamp}/`.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub root: PathBuf,
    pub audit_log: PathBuf,
    pub failures_log: PathBuf,
    pub screenshots_dir: PathBuf,
    pub html_dir: PathBuf,
}

impl RunPaths {
    /// Creates a fresh run directory stamped with the current UTC time.
    pub fn create(out_dir: &Path, site_host: &str) -> CheckpointResult<Self> {
        let stamp = Utc::now().format("%Y%m%d-%H%M%S").to_string();
        Self::create_stamped(out_dir, site_host, &stamp)
    }

    /// Two runs starting within the same second get `-2`, `-3`, ... leaves
    /// instead of sharing a directory.
    pub(crate) fn create_stamped(
        out_dir: &Path,
        site_host: &str,
        stamp: &str,
    ) -> CheckpointResult<Self> {
        let site_dir = out_dir.join(site_host);
        fs::create_dir_all(&site_dir)?;
        let mut leaf = stamp.to_string();
        let mut attempt = 2u32;
        let root = loop {
            let candidate = site_dir.join(&leaf);
            match fs::create_dir(&candidate) {
                Ok(()) => break candidate,
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    leaf = format!("{stamp}-{attempt}");
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        };
        let paths = Self::open(&root);
        paths.prepare()?;
        Ok(paths)
    }

    /// Points at an existing run directory, as used when resuming.
    pub fn open(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            audit_log: root.join(AUDIT_LOG_NAME),
            failures_log: root.join(FAILURES_LOG_NAME),
            screenshots_dir: root.join(SCREENSHOTS_DIR),
            html_dir: root.join(HTML_DIR),
        }
    }

    pub fn prepare(&self) -> CheckpointResult<()> {
        fs::create_dir_all(&self.screenshots_dir)?;
        fs::create_dir_all(&self.html_dir)?;
        Ok(())
    }
}

/// Finds the newest prior run directory for a site that actually holds a
/// checkpoint log. Timestamps are fixed width, so lexicographic order on
/// the directory name is chronological order.
pub fn latest_run_dir(out_dir: &Path, site_host: &str) -> CheckpointResult<Option<PathBuf>> {
    let site_dir = out_dir.join(site_host);
    if !site_dir.is_dir() {
        return Ok(None);
    }
    let mut best: Option<PathBuf> = None;
    for entry in fs::read_dir(&site_dir)? {
        let path = entry?.path();
        if !path.is_dir() || !path.join(AUDIT_LOG_NAME).is_file() {
            continue;
        }
        let newer = best
            .as_ref()
            .map_or(true, |current| path.file_name() > current.file_name());
        if newer {
            best = Some(path);
        }
    }
    Ok(best)
}

/// Collects query ids already present in a checkpoint log, skipping lines
/// that fail to parse. Returns the ids and how many lines were skipped.
pub fn completed_ids(path: &Path) -> CheckpointResult<(HashSet<String>, usize)> {
    let mut ids = HashSet::new();
    let mut skipped = 0usize;
    if !path.is_file() {
        return Ok((ids, skipped));
    }
    let reader = BufReader::new(File::open(path)?);
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<AuditRecord>(&line) {
            Ok(record) => {
                ids.insert(record.query.id);
            }
            Err(err) => {
                skipped += 1;
                warn!(
                    line = index + 1,
                    path = %path.display(),
                    error = %err,
                    "Skipping malformed checkpoint line"
                );
            }
        }
    }
    Ok((ids, skipped))
}

/// Loads every parseable record from a checkpoint log, in file order.
pub fn load_records(path: &Path) -> CheckpointResult<(Vec<AuditRecord>, usize)> {
    let mut records = Vec::new();
    let mut skipped = 0usize;
    if !path.is_file() {
        return Ok((records, skipped));
    }
    let reader = BufReader::new(File::open(path)?);
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<AuditRecord>(&line) {
            Ok(record) => records.push(record),
            Err(_) => skipped += 1,
        }
    }
    Ok((records, skipped))
}

/// Append-only writer for the audit checkpoint. Each record becomes one
/// JSON line, flushed before the call returns.
#[derive(Debug)]
pub struct CheckpointLog {
    file: File,
    path: PathBuf,
}

impl CheckpointLog {
    pub fn append_to(path: &Path) -> CheckpointResult<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn append(&mut self, record: &AuditRecord) -> CheckpointResult<()> {
        let line = serde_json::to_string(record)?;
        writeln!(self.file, "{line}")?;
        self.file.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// What the orchestrator decided to do about a failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RemediationAction {
    RetryScheduled { delay_ms: u64 },
    ProxyRotated { proxy: String },
    SkippedTimeout,
    Abort,
}

/// One failed attempt, as written to `failures.jsonl`.
#[derive(Debug, Clone, Serialize)]
pub struct FailureContext {
    pub timestamp: DateTime<Utc>,
    pub query_id: String,
    pub attempt: u32,
    pub kind: ErrorKind,
    pub message: String,
    #[serde(flatten)]
    pub action: RemediationAction,
}

impl FailureContext {
    pub fn new(query_id: &str, attempt: u32, kind: ErrorKind, message: String) -> Self {
        Self {
            timestamp: Utc::now(),
            query_id: query_id.to_string(),
            attempt,
            kind,
            message,
            action: RemediationAction::Abort,
        }
    }

    pub fn with_action(mut self, action: RemediationAction) -> Self {
        self.action = action;
        self
    }
}

/// Append-only failure journal kept next to the checkpoint log.
#[derive(Debug)]
pub struct FailureLog {
    file: File,
}

impl FailureLog {
    pub fn append_to(path: &Path) -> CheckpointResult<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }

    pub fn record(&mut self, context: &FailureContext) -> CheckpointResult<()> {
        let line = serde_json::to_string(context)?;
        writeln!(self.file, "{line}")?;
        self.file.flush()?;
        Ok(())
    }
}
