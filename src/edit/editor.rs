use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use similar::TextDiff;
use thiserror::Error;
use tracing::{debug, warn};

use crate::edit::backup::{BackupError, BackupManager, BackupRef};
use crate::security::{ConfineError, confine_path};

/// Hard cap on the size of a file the editor will touch.
pub const MAX_FILE_SIZE: u64 = 1_000_000;

#[derive(Debug, Error)]
pub enum EditError {
    #[error("Path escapes the sandbox: {0}")]
    SandboxViolation(PathBuf),

    #[error("File not found: {0}")]
    NotFound(PathBuf),

    #[error("Not a regular file: {0}")]
    NotAFile(PathBuf),

    #[error("File too large to edit: {size} bytes (limit {MAX_FILE_SIZE})")]
    TooLarge { size: u64 },

    #[error("Line {line} is out of range (file has {len} lines)")]
    LineOutOfRange { line: usize, len: usize },

    #[error("Line {line} does not match: expected {expected:?}, found {found:?}")]
    LineMismatch {
        line: usize,
        expected: String,
        found: String,
    },

    #[error("Validation failed: {message}")]
    SyntaxValidation { message: String, diff: String },

    #[error("Post-write validation failed, rolled back: {message}")]
    PostWriteValidation {
        message: String,
        backup: BackupRef,
        diff: String,
    },

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One requested change. Line numbers are 1-based and address the buffer as
/// it stands after the previous change in the same request was applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeOp {
    /// Replace a line whose current content must equal `old`.
    Replace {
        line: usize,
        old: String,
        #[serde(alias = "content")]
        new: String,
    },
    /// Insert after `line`; 0 inserts at the top of the file.
    Insert {
        line: usize,
        #[serde(alias = "content")]
        new: String,
    },
    /// Delete one line.
    Delete { line: usize },
    /// Replace the entire file content.
    WholeFile { content: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct EditResult {
    pub diff: String,
    pub backup: Option<BackupRef>,
    pub validated: bool,
    pub dry_run: bool,
    pub summary: String,
}

/// Applies line-level edits inside the sandbox: content is verified before a
/// change lands, a backup precedes every write, and a file that fails
/// validation after the write is rolled back to that backup.
type ContentCheck = fn(&Path, &str) -> Result<(), String>;

pub struct FileEditor {
    sandbox_root: PathBuf,
    backups: BackupManager,
    post_write_check: ContentCheck,
}

impl FileEditor {
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(sandbox_root: P, backup_dir: Q) -> Self {
        let root = sandbox_root.as_ref().to_path_buf();
        let backups = BackupManager::new(&root, backup_dir);
        Self {
            sandbox_root: root,
            backups,
            post_write_check: check_content,
        }
    }

    /// Swap the verification applied to content re-read after a write.
    #[cfg(test)]
    fn with_post_write_check(mut self, check: ContentCheck) -> Self {
        self.post_write_check = check;
        self
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    /// Apply `changes` to `path`. With `validate` set, the new content must
    /// pass syntax and pattern checks both before and after the write; a
    /// post-write failure restores the file from its backup. A dry run stops
    /// after producing the diff.
    pub fn edit(
        &self,
        path: &Path,
        changes: &[ChangeOp],
        validate: bool,
        dry_run: bool,
    ) -> Result<EditResult, EditError> {
        let resolved = self.resolve(path)?;

        let metadata = fs::metadata(&resolved)?;
        if !metadata.is_file() {
            return Err(EditError::NotAFile(resolved));
        }
        if metadata.len() > MAX_FILE_SIZE {
            return Err(EditError::TooLarge {
                size: metadata.len(),
            });
        }

        let original = fs::read_to_string(&resolved)?;
        let updated = apply_changes(&original, changes)?;

        let display = path.display().to_string();
        let diff = unified_diff(&original, &updated, &display);
        let summary = summarize(changes);

        if dry_run {
            return Ok(EditResult {
                diff,
                backup: None,
                validated: false,
                dry_run: true,
                summary,
            });
        }

        if validate
            && let Err(message) = check_content(&resolved, &updated)
        {
            return Err(EditError::SyntaxValidation { message, diff });
        }

        let backup = self.backups.store(&resolved, &original)?;
        fs::write(&resolved, &updated)?;
        debug!(path = %resolved.display(), backup = %backup.backup_file.display(), "file edited");

        if validate {
            let written = fs::read_to_string(&resolved)?;
            if let Err(message) = (self.post_write_check)(&resolved, &written) {
                warn!(path = %resolved.display(), "post-write validation failed, rolling back");
                self.revert(&resolved, &original)?;
                return Err(EditError::PostWriteValidation {
                    message,
                    backup,
                    diff,
                });
            }
        }

        Ok(EditResult {
            diff,
            backup: Some(backup),
            validated: validate,
            dry_run: false,
            summary,
        })
    }

    /// Put known-good content back after a failed post-write check.
    fn revert(&self, path: &Path, original: &str) -> Result<(), EditError> {
        fs::write(path, original)?;
        Ok(())
    }

    fn resolve(&self, path: &Path) -> Result<PathBuf, EditError> {
        let requested = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.sandbox_root.join(path)
        };

        match confine_path(&self.sandbox_root, &requested) {
            Ok(resolved) => Ok(resolved),
            Err(ConfineError::Escapes(p)) => Err(EditError::SandboxViolation(p)),
            Err(ConfineError::Unresolvable(_)) => Err(EditError::NotFound(requested)),
        }
    }
}

/// Apply changes in order against the evolving buffer. Line terminators are
/// preserved; a file with no trailing newline keeps not having one.
fn apply_changes(original: &str, changes: &[ChangeOp]) -> Result<String, EditError> {
    let mut lines: Vec<String> = original.split_inclusive('\n').map(String::from).collect();

    for change in changes {
        match change {
            ChangeOp::WholeFile { content } => {
                lines = content.split_inclusive('\n').map(String::from).collect();
            }
            ChangeOp::Replace { line, old, new } => {
                let index = line_index(*line, lines.len())?;
                let (body, terminator) = split_terminator(&lines[index]);
                if body != old {
                    return Err(EditError::LineMismatch {
                        line: *line,
                        expected: old.clone(),
                        found: body.to_string(),
                    });
                }
                lines[index] = format!("{}{}", new, terminator);
            }
            ChangeOp::Insert { line, new } => {
                if *line > lines.len() {
                    return Err(EditError::LineOutOfRange {
                        line: *line,
                        len: lines.len(),
                    });
                }
                // Inserting at the very end of a file that lacks a trailing
                // newline means the previously-last line gains one.
                if *line == lines.len()
                    && let Some(last) = lines.last_mut()
                    && !last.ends_with('\n')
                {
                    last.push('\n');
                }
                lines.insert(*line, format!("{}\n", new));
            }
            ChangeOp::Delete { line } => {
                let index = line_index(*line, lines.len())?;
                lines.remove(index);
            }
        }
    }

    Ok(lines.concat())
}

fn line_index(line: usize, len: usize) -> Result<usize, EditError> {
    if line == 0 || line > len {
        return Err(EditError::LineOutOfRange { line, len });
    }
    Ok(line - 1)
}

fn split_terminator(line: &str) -> (&str, &str) {
    if let Some(body) = line.strip_suffix("\r\n") {
        (body, "\r\n")
    } else if let Some(body) = line.strip_suffix('\n') {
        (body, "\n")
    } else {
        (line, "")
    }
}

fn unified_diff(original: &str, updated: &str, display: &str) -> String {
    TextDiff::from_lines(original, updated)
        .unified_diff()
        .context_radius(3)
        .header(&format!("a/{}", display), &format!("b/{}", display))
        .to_string()
}

fn summarize(changes: &[ChangeOp]) -> String {
    let mut replaced = 0usize;
    let mut inserted = 0usize;
    let mut deleted = 0usize;
    let mut rewritten = false;

    for change in changes {
        match change {
            ChangeOp::Replace { .. } => replaced += 1,
            ChangeOp::Insert { .. } => inserted += 1,
            ChangeOp::Delete { .. } => deleted += 1,
            ChangeOp::WholeFile { .. } => rewritten = true,
        }
    }

    let mut parts = Vec::new();
    if rewritten {
        parts.push("rewrote file".to_string());
    }
    if replaced > 0 {
        parts.push(format!("replaced {} line(s)", replaced));
    }
    if inserted > 0 {
        parts.push(format!("inserted {} line(s)", inserted));
    }
    if deleted > 0 {
        parts.push(format!("deleted {} line(s)", deleted));
    }
    if parts.is_empty() {
        parts.push("no changes".to_string());
    }
    parts.join(", ")
}

/// Syntax check by extension plus a scan for patterns that have no business
/// appearing in sandbox-edited files.
fn check_content(path: &Path, content: &str) -> Result<(), String> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => {
            serde_json::from_str::<serde_json::Value>(content)
                .map_err(|e| format!("invalid JSON: {}", e))?;
        }
        Some("toml") => {
            toml::from_str::<toml::Value>(content).map_err(|e| format!("invalid TOML: {}", e))?;
        }
        _ => {}
    }

    for pattern in dangerous_patterns() {
        if let Some(found) = pattern.find(content) {
            return Err(format!("dangerous pattern: {}", found.as_str()));
        }
    }

    Ok(())
}

fn dangerous_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"\beval\s*\(",
            r"\bexec\s*\(",
            r"__import__",
            r"os\.system",
            r"subprocess\.\w+\([^)]*shell\s*=\s*True",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}
