use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

const MAX_LOG_SIZE: u64 = 10 * 1024 * 1024; // 10MB

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode audit record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One execution attempt and its outcome. Output content is never stored,
/// only byte lengths; the record is written before the call returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: String,
    pub session: String,
    pub command: String,
    pub working_dir: String,
    pub exit_code: Option<i32>,
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
    pub duration_ms: u64,
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
}

impl AuditRecord {
    /// Record for a call that was rejected before any process was spawned.
    pub fn rejected(session: &str, command: &str, working_dir: &str, reason: &str) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            session: session.to_string(),
            command: command.to_string(),
            working_dir: working_dir.to_string(),
            exit_code: None,
            stdout_bytes: 0,
            stderr_bytes: 0,
            duration_ms: 0,
            dry_run: false,
            rejection_reason: Some(reason.to_string()),
        }
    }

    /// Record for a call that ran to completion, failure, or timeout.
    pub fn completed(
        session: &str,
        command: &str,
        working_dir: &Path,
        exit_code: Option<i32>,
        stdout_bytes: u64,
        stderr_bytes: u64,
        duration: Duration,
    ) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            session: session.to_string(),
            command: command.to_string(),
            working_dir: working_dir.display().to_string(),
            exit_code,
            stdout_bytes,
            stderr_bytes,
            duration_ms: duration.as_millis() as u64,
            dry_run: false,
            rejection_reason: None,
        }
    }
}

/// Append-only audit log: one JSON record per line, flushed per write.
///
/// Records are never edited or removed here; retention beyond the size-based
/// rotation is an operational concern.
pub struct AuditLogger {
    log_path: PathBuf,
    write_lock: Mutex<()>,
}

impl AuditLogger {
    pub fn with_path<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let log_path = path.as_ref().to_path_buf();

        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent)?;
        }

        Ok(Self {
            log_path,
            write_lock: Mutex::new(()),
        })
    }

    /// Append one record and flush it before returning.
    pub fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let line = serde_json::to_string(record)?;

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        self.rotate_if_needed()?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;

        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        file.sync_all()?;

        Ok(())
    }

    /// The `n` most recent records, oldest first. A malformed record (for
    /// example a torn trailing line from a crash mid-write) is skipped
    /// rather than failing the whole read.
    pub fn tail(&self, n: usize) -> Result<Vec<AuditRecord>, AuditError> {
        if !self.log_path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.log_path)?;
        let mut records = Vec::new();

        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(error = %e, "skipping malformed audit record"),
            }
        }

        let start = records.len().saturating_sub(n);
        Ok(records.split_off(start))
    }

    /// Rotate the log to `.1` once it exceeds the size cap. Holding the
    /// write lock is the caller's responsibility.
    fn rotate_if_needed(&self) -> std::io::Result<()> {
        if !self.log_path.exists() {
            return Ok(());
        }

        let metadata = fs::metadata(&self.log_path)?;
        if metadata.len() > MAX_LOG_SIZE {
            let backup_path = self.log_path.with_extension("log.1");
            fs::rename(&self.log_path, backup_path)?;
        }

        Ok(())
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }
}
