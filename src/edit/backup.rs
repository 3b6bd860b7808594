use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("Backup path escapes the backup directory: {0}")]
    OutsideBackupDir(PathBuf),

    #[error("Backup not found: {0}")]
    NotFound(PathBuf),

    #[error("Cannot derive a backup name for: {0}")]
    BadName(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Handle to one stored snapshot. `backup_file` is relative to the backup
/// directory and doubles as the stable identifier callers pass to restore.
#[derive(Debug, Clone, Serialize)]
pub struct BackupRef {
    pub original_path: PathBuf,
    pub timestamp: String,
    pub backup_file: PathBuf,
}

/// One entry as reported by `list`.
#[derive(Debug, Clone, Serialize)]
pub struct BackupEntry {
    pub file: PathBuf,
    pub timestamp: String,
    pub size: u64,
}

/// Outcome of a restore: the restore itself produced a fresh backup of the
/// content it overwrote, so every restore is reversible.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreOutcome {
    pub restored_path: PathBuf,
    pub backup_used: PathBuf,
    pub new_backup: Option<BackupRef>,
}

/// Owns the backup store: a directory mirroring the sandbox tree, holding
/// timestamp-suffixed snapshot files. Snapshots are never overwritten.
pub struct BackupManager {
    backup_dir: PathBuf,
    sandbox_root: PathBuf,
}

impl BackupManager {
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(sandbox_root: P, backup_dir: Q) -> Self {
        Self {
            backup_dir: backup_dir.as_ref().to_path_buf(),
            sandbox_root: sandbox_root.as_ref().to_path_buf(),
        }
    }

    /// Snapshot `content` as the pre-mutation state of `path`. The snapshot
    /// is flushed to disk before this returns; names embed the capture
    /// timestamp and a disambiguating counter, so they never collide.
    pub fn store(&self, path: &Path, content: &str) -> Result<BackupRef, BackupError> {
        let relative = self.relative_to_root(path)?;
        let file_name = relative
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| BackupError::BadName(path.to_path_buf()))?
            .to_string();
        let parent = relative.parent().unwrap_or(Path::new("")).to_path_buf();

        let target_dir = self.backup_dir.join(&parent);
        fs::create_dir_all(&target_dir)?;

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();

        let mut attempt: u32 = 0;
        loop {
            let candidate = if attempt == 0 {
                format!("{}.{}.bak", file_name, timestamp)
            } else {
                format!("{}.{}-{}.bak", file_name, timestamp, attempt)
            };
            let full = target_dir.join(&candidate);

            match OpenOptions::new().write(true).create_new(true).open(&full) {
                Ok(mut file) => {
                    file.write_all(content.as_bytes())?;
                    file.sync_all()?;
                    debug!(backup = %full.display(), "stored backup");
                    return Ok(BackupRef {
                        original_path: path.to_path_buf(),
                        timestamp,
                        backup_file: parent.join(candidate),
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Enumerate snapshots, newest first: all of them, or only those taken
    /// for `path`.
    pub fn list(&self, path: Option<&Path>) -> Result<Vec<BackupEntry>, BackupError> {
        let mut entries = Vec::new();

        match path {
            Some(path) => {
                let relative = self.relative_to_root(path)?;
                let file_name = relative
                    .file_name()
                    .and_then(|n| n.to_str())
                    .ok_or_else(|| BackupError::BadName(path.to_path_buf()))?
                    .to_string();
                let dir = self
                    .backup_dir
                    .join(relative.parent().unwrap_or(Path::new("")));
                if dir.exists() {
                    collect_snapshots(&dir, &self.backup_dir, &mut entries)?;
                }
                let prefix = format!("{}.", file_name);
                entries.retain(|entry| {
                    entry
                        .file
                        .file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| n.starts_with(&prefix))
                        .unwrap_or(false)
                });
            }
            None => {
                if self.backup_dir.exists() {
                    collect_snapshots(&self.backup_dir, &self.backup_dir, &mut entries)?;
                }
            }
        }

        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.file.cmp(&a.file)));
        Ok(entries)
    }

    /// Restore the file a snapshot was taken from. The content about to be
    /// overwritten is snapshotted first.
    pub fn restore(&self, backup_file: &Path) -> Result<RestoreOutcome, BackupError> {
        let full = self.backup_dir.join(backup_file);
        let resolved = full
            .canonicalize()
            .map_err(|_| BackupError::NotFound(backup_file.to_path_buf()))?;

        let backup_root = self
            .backup_dir
            .canonicalize()
            .map_err(|_| BackupError::NotFound(self.backup_dir.clone()))?;
        if !resolved.starts_with(&backup_root) {
            return Err(BackupError::OutsideBackupDir(backup_file.to_path_buf()));
        }

        let relative = resolved
            .strip_prefix(&backup_root)
            .map_err(|_| BackupError::OutsideBackupDir(backup_file.to_path_buf()))?
            .to_path_buf();

        let original_name = original_file_name(&relative)
            .ok_or_else(|| BackupError::BadName(backup_file.to_path_buf()))?;
        let original_path = self
            .sandbox_root
            .join(relative.parent().unwrap_or(Path::new("")))
            .join(original_name);

        let new_backup = if original_path.exists() {
            let current = fs::read_to_string(&original_path)?;
            Some(self.store(&original_path, &current)?)
        } else {
            None
        };

        let snapshot = fs::read_to_string(&resolved)?;
        fs::write(&original_path, snapshot)?;
        debug!(path = %original_path.display(), "restored from backup");

        Ok(RestoreOutcome {
            restored_path: original_path,
            backup_used: relative,
            new_backup,
        })
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    fn relative_to_root(&self, path: &Path) -> Result<PathBuf, BackupError> {
        match path.strip_prefix(&self.sandbox_root) {
            Ok(relative) => Ok(relative.to_path_buf()),
            Err(_) => path
                .file_name()
                .map(PathBuf::from)
                .ok_or_else(|| BackupError::BadName(path.to_path_buf())),
        }
    }
}

/// Strip `.bak` and the timestamp segment from a snapshot file name.
fn original_file_name(relative: &Path) -> Option<String> {
    let name = relative.file_name()?.to_str()?;
    let without_bak = name.strip_suffix(".bak")?;
    let (original, _timestamp) = without_bak.rsplit_once('.')?;
    if original.is_empty() {
        return None;
    }
    Some(original.to_string())
}

fn collect_snapshots(
    dir: &Path,
    backup_root: &Path,
    out: &mut Vec<BackupEntry>,
) -> Result<(), BackupError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_snapshots(&path, backup_root, out)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some("bak") {
            let metadata = entry.metadata()?;
            let file = path
                .strip_prefix(backup_root)
                .unwrap_or(&path)
                .to_path_buf();
            let timestamp = snapshot_timestamp(&file).unwrap_or_default();
            out.push(BackupEntry {
                file,
                timestamp,
                size: metadata.len(),
            });
        }
    }
    Ok(())
}

fn snapshot_timestamp(relative: &Path) -> Option<String> {
    let name = relative.file_name()?.to_str()?;
    let without_bak = name.strip_suffix(".bak")?;
    let (_, timestamp) = without_bak.rsplit_once('.')?;
    Some(timestamp.to_string())
}
