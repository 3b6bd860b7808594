use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::error;

use crate::audit::{AuditLogger, AuditRecord};
use crate::config::Config;
use crate::edit::{BackupEntry, ChangeOp, EditError, FileEditor};
use crate::exec::{ExecutionRequest, SandboxExecutor};
use crate::security::{CommandSpec, CommandValidator, RateLimiter, Whitelist};
use crate::workflow::{WorkflowOrchestrator, WorkflowParams, WorkflowStep};

/// Listing caps for the reporting endpoints.
pub const MAX_BACKUPS_LISTED: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
    Timeout,
}

#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    pub status: Status,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub duration_ms: u64,
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WhitelistResponse {
    pub commands: Vec<CommandSpec>,
    pub categories: BTreeMap<String, Vec<String>>,
    pub rate_limit: RateLimitInfo,
}

#[derive(Debug, Serialize)]
pub struct RateLimitInfo {
    pub max_commands: usize,
    pub window_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct AuditResponse {
    pub status: Status,
    pub records: Vec<AuditRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EditResponse {
    pub status: Status,
    pub diff: String,
    pub backup_file: Option<PathBuf>,
    pub validated: bool,
    pub dry_run: bool,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BackupsResponse {
    pub status: Status,
    pub backups: Vec<BackupEntry>,
    pub total: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RestoreResponse {
    pub status: Status,
    pub restored_path: Option<PathBuf>,
    pub backup_used: Option<PathBuf>,
    pub new_backup_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WorkflowResponse {
    pub status: Status,
    pub branch: Option<String>,
    pub commit: Option<String>,
    pub publication_url: Option<String>,
    pub steps_completed: Vec<WorkflowStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<WorkflowStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_completed: Option<WorkflowStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The request/response surface of the subsystem. Methods never return Err;
/// every outcome, including rejections and internal failures, is reported in
/// the response's `status` and `error` fields so a caller driving this over
/// a serialized protocol gets a well-formed answer either way.
pub struct ExecService {
    executor: SandboxExecutor,
    editor: FileEditor,
    config: Config,
}

impl ExecService {
    pub fn new(config: &Config) -> crate::error::Result<Self> {
        Self::with_whitelist(config, Whitelist::builtin())
    }

    /// Build the service around a custom whitelist. Embedders use this to
    /// narrow the builtin table; tests use it to widen it.
    pub fn with_whitelist(config: &Config, whitelist: Whitelist) -> crate::error::Result<Self> {
        config.validate()?;

        let validator = CommandValidator::new(whitelist, &config.sandbox.root);
        let limiter = RateLimiter::new(
            config.rate_limit.max_commands,
            Duration::from_secs(config.rate_limit.window_seconds),
        );
        let audit = AuditLogger::with_path(&config.sandbox.audit_log)?;
        let executor = SandboxExecutor::new(validator, limiter, audit)
            .with_capture_limit(config.executor.max_output_bytes);
        let editor = FileEditor::new(&config.sandbox.root, &config.sandbox.backup_dir);

        Ok(Self {
            executor,
            editor,
            config: config.clone(),
        })
    }

    pub fn executor(&self) -> &SandboxExecutor {
        &self.executor
    }

    /// Run one command through the full pipeline.
    pub fn execute_command(
        &self,
        session: &str,
        command: &str,
        working_dir: Option<&Path>,
        dry_run: bool,
        approval_granted: bool,
        timeout_secs: Option<u64>,
    ) -> ExecuteResponse {
        let timeout = Duration::from_secs(
            timeout_secs.unwrap_or(self.config.executor.timeout_seconds),
        );

        let mut request = ExecutionRequest::new(command)
            .dry_run(dry_run)
            .approval_granted(approval_granted)
            .timeout(timeout);
        if let Some(dir) = working_dir {
            request = request.working_dir(dir);
        }

        match self.executor.execute(&request, session) {
            Ok(result) => ExecuteResponse {
                status: if result.timed_out {
                    Status::Timeout
                } else {
                    Status::Success
                },
                exit_code: result.exit_code,
                stdout: result.stdout,
                stderr: result.stderr,
                stdout_truncated: result.stdout_truncated,
                stderr_truncated: result.stderr_truncated,
                duration_ms: result.duration.as_millis() as u64,
                dry_run: result.dry_run,
                error: None,
            },
            Err(e) => ExecuteResponse {
                status: Status::Error,
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                stdout_truncated: false,
                stderr_truncated: false,
                duration_ms: 0,
                dry_run,
                error: Some(e.to_string()),
            },
        }
    }

    /// The whitelist as reportable data, grouped by risk category.
    pub fn command_whitelist(&self) -> WhitelistResponse {
        let commands: Vec<CommandSpec> = self
            .executor
            .validator()
            .whitelist()
            .entries()
            .into_iter()
            .cloned()
            .collect();

        let mut categories: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for spec in &commands {
            categories
                .entry(spec.category.as_str().to_string())
                .or_default()
                .push(spec.name.clone());
        }

        WhitelistResponse {
            commands,
            categories,
            rate_limit: RateLimitInfo {
                max_commands: self.config.rate_limit.max_commands,
                window_seconds: self.config.rate_limit.window_seconds,
            },
        }
    }

    /// The most recent audit records, oldest first.
    pub fn audit_logs(&self, lines: usize) -> AuditResponse {
        match self.executor.audit().tail(lines) {
            Ok(records) => AuditResponse {
                status: Status::Success,
                records,
                error: None,
            },
            Err(e) => {
                error!(error = %e, "audit log read failed");
                AuditResponse {
                    status: Status::Error,
                    records: Vec::new(),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Apply line edits to a sandboxed file. Every non-dry-run call is
    /// audited, successful or not.
    pub fn edit_file(
        &self,
        session: &str,
        path: &Path,
        changes: &[ChangeOp],
        validate: bool,
        dry_run: bool,
    ) -> EditResponse {
        let started = Instant::now();
        let described = format!("edit_file {}", path.display());

        match self.editor.edit(path, changes, validate, dry_run) {
            Ok(result) => {
                if !result.dry_run
                    && let Err(e) = self.audit_mutation(session, &described, started)
                {
                    return edit_error_response(dry_run, e.to_string());
                }
                EditResponse {
                    status: Status::Success,
                    diff: result.diff,
                    backup_file: result.backup.map(|b| b.backup_file),
                    validated: result.validated,
                    dry_run: result.dry_run,
                    summary: result.summary,
                    error: None,
                }
            }
            Err(e) => {
                let reason = e.to_string();
                if !dry_run
                    && let Err(audit_err) =
                        self.audit_rejected_mutation(session, &described, &reason)
                {
                    error!(error = %audit_err, "audit write failed for rejected edit");
                }
                // Validation failures still carry the diff (and, after a
                // rollback, the backup that was used) so the caller can
                // review what was attempted.
                let mut response = edit_error_response(dry_run, reason);
                match e {
                    EditError::SyntaxValidation { diff, .. } => response.diff = diff,
                    EditError::PostWriteValidation { diff, backup, .. } => {
                        response.diff = diff;
                        response.backup_file = Some(backup.backup_file);
                    }
                    _ => {}
                }
                response
            }
        }
    }

    /// Backups, newest first, capped at `MAX_BACKUPS_LISTED`. `total` is the
    /// uncapped count.
    pub fn list_backups(&self, path: Option<&Path>) -> BackupsResponse {
        match self.editor.backups().list(path) {
            Ok(mut backups) => {
                let total = backups.len();
                backups.truncate(MAX_BACKUPS_LISTED);
                BackupsResponse {
                    status: Status::Success,
                    backups,
                    total,
                    error: None,
                }
            }
            Err(e) => BackupsResponse {
                status: Status::Error,
                backups: Vec::new(),
                total: 0,
                error: Some(e.to_string()),
            },
        }
    }

    /// Restore a file from a named backup. Audited like an edit.
    pub fn restore_backup(&self, session: &str, backup_file: &Path) -> RestoreResponse {
        let started = Instant::now();
        let described = format!("restore_backup {}", backup_file.display());

        match self.editor.backups().restore(backup_file) {
            Ok(outcome) => {
                if let Err(e) = self.audit_mutation(session, &described, started) {
                    return RestoreResponse {
                        status: Status::Error,
                        restored_path: None,
                        backup_used: None,
                        new_backup_file: None,
                        error: Some(e.to_string()),
                    };
                }
                RestoreResponse {
                    status: Status::Success,
                    restored_path: Some(outcome.restored_path),
                    backup_used: Some(outcome.backup_used),
                    new_backup_file: outcome.new_backup.map(|b| b.backup_file),
                    error: None,
                }
            }
            Err(e) => {
                if let Err(audit_err) =
                    self.audit_rejected_mutation(session, &described, &e.to_string())
                {
                    error!(error = %audit_err, "audit write failed for rejected restore");
                }
                RestoreResponse {
                    status: Status::Error,
                    restored_path: None,
                    backup_used: None,
                    new_backup_file: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Drive the branch-test-commit-push workflow. Each underlying command
    /// is validated and audited individually by the executor.
    pub fn run_workflow(&self, session: &str, params: &WorkflowParams) -> WorkflowResponse {
        let mut effective = params.clone();
        if effective.base_branch.is_none() {
            effective.base_branch = self.config.workflow.default_base_branch.clone();
        }

        let orchestrator = WorkflowOrchestrator::new(&self.executor, &self.config.sandbox.root)
            .test_command(&self.config.workflow.test_command)
            .test_timeout(Duration::from_secs(self.config.workflow.test_timeout_seconds));

        match orchestrator.run(session, &effective) {
            Ok(result) => WorkflowResponse {
                status: Status::Success,
                branch: Some(result.branch),
                commit: Some(result.commit),
                publication_url: result.publication_url,
                steps_completed: result.steps_completed,
                failed_step: None,
                last_completed: None,
                error: None,
            },
            Err(e) => WorkflowResponse {
                status: Status::Error,
                branch: None,
                commit: None,
                publication_url: None,
                steps_completed: Vec::new(),
                failed_step: Some(e.step),
                last_completed: e.last_completed,
                error: Some(e.message),
            },
        }
    }

    fn audit_mutation(
        &self,
        session: &str,
        command: &str,
        started: Instant,
    ) -> Result<(), crate::audit::AuditError> {
        self.executor.audit().append(&AuditRecord::completed(
            session,
            command,
            &self.config.sandbox.root,
            Some(0),
            0,
            0,
            started.elapsed(),
        ))
    }

    fn audit_rejected_mutation(
        &self,
        session: &str,
        command: &str,
        reason: &str,
    ) -> Result<(), crate::audit::AuditError> {
        self.executor.audit().append(&AuditRecord::rejected(
            session,
            command,
            &self.config.sandbox.root.display().to_string(),
            reason,
        ))
    }
}

fn edit_error_response(dry_run: bool, error: String) -> EditResponse {
    EditResponse {
        status: Status::Error,
        diff: String::new(),
        backup_file: None,
        validated: false,
        dry_run,
        summary: String::new(),
        error: Some(error),
    }
}
