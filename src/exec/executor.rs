use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use crate::audit::{AuditError, AuditLogger, AuditRecord};
use crate::security::{CommandValidator, RateLimitError, RateLimiter, ValidationError};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Capture cap per stream. Output beyond this is discarded and the result
/// is flagged truncated.
pub const MAX_CAPTURE_BYTES: usize = 1024 * 1024;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// One execute-command request. Transient, one per call.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub command: String,
    pub working_dir: Option<PathBuf>,
    pub dry_run: bool,
    pub approval_granted: bool,
    pub timeout: Duration,
}

impl ExecutionRequest {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            working_dir: None,
            dry_run: false,
            approval_granted: false,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn working_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn approval_granted(mut self, granted: bool) -> Self {
        self.approval_granted = granted;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Outcome of an admitted execution (or of a dry run, which never spawns).
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub duration: Duration,
    pub timed_out: bool,
    pub dry_run: bool,
}

impl ExecutionResult {
    fn dry_run_ok() -> Self {
        Self {
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            duration: Duration::ZERO,
            timed_out: false,
            dry_run: true,
        }
    }

    pub fn success(&self) -> bool {
        self.dry_run || (!self.timed_out && self.exit_code == Some(0))
    }
}

#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    #[error("Command requires prior approval: {0}")]
    ApprovalRequired(String),

    #[error("Failed to spawn process: {0}")]
    Spawn(std::io::Error),

    #[error("Audit log write failed: {0}")]
    Audit(#[from] AuditError),
}

/// Spawns and supervises validated commands inside the sandbox.
///
/// The command is launched directly from an argument vector, never through a
/// shell. The executor owns the child exclusively for the duration of the
/// call: the hard timeout kills the whole process group, so no detached
/// children survive a call. Every non-dry-run call writes exactly one audit
/// record before returning, whether it was admitted or rejected.
pub struct SandboxExecutor {
    validator: CommandValidator,
    limiter: RateLimiter,
    audit: AuditLogger,
    max_capture: usize,
}

impl SandboxExecutor {
    pub fn new(validator: CommandValidator, limiter: RateLimiter, audit: AuditLogger) -> Self {
        Self {
            validator,
            limiter,
            audit,
            max_capture: MAX_CAPTURE_BYTES,
        }
    }

    pub fn with_capture_limit(mut self, bytes: usize) -> Self {
        self.max_capture = bytes;
        self
    }

    pub fn validator(&self) -> &CommandValidator {
        &self.validator
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    /// Run one command for `session` through the full pipeline:
    /// validation, approval gate, rate limiting, sandboxed spawn.
    pub fn execute(
        &self,
        request: &ExecutionRequest,
        session: &str,
    ) -> Result<ExecutionResult, ExecuteError> {
        let admitted = match self
            .validator
            .validate(&request.command, request.working_dir.as_deref())
        {
            Ok(admitted) => admitted,
            Err(e) => {
                debug!(command = %request.command, reason = %e, "command rejected");
                self.audit_rejection(request, session, &e.to_string())?;
                return Err(e.into());
            }
        };

        if admitted.spec.requires_approval && !request.approval_granted {
            let err = ExecuteError::ApprovalRequired(admitted.program.clone());
            self.audit_rejection(request, session, &err.to_string())?;
            return Err(err);
        }

        if request.dry_run {
            return Ok(ExecutionResult::dry_run_ok());
        }

        if let Err(e) = self.limiter.admit(session) {
            self.audit_rejection(request, session, &e.to_string())?;
            return Err(e.into());
        }

        let mut cmd = Command::new(&admitted.program);
        cmd.args(&admitted.args)
            .current_dir(&admitted.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Own process group, so the timeout can take down grandchildren too.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let started = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.audit_rejection(request, session, &format!("spawn failed: {}", e))?;
                return Err(ExecuteError::Spawn(e));
            }
        };

        let stdout_handle = child.stdout.take().map(|s| drain(s, self.max_capture));
        let stderr_handle = child.stderr.take().map(|s| drain(s, self.max_capture));

        let deadline = started + request.timeout;
        let mut timed_out = false;

        loop {
            match child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) => {
                    if Instant::now() >= deadline {
                        warn!(command = %request.command, "timeout expired, killing process group");
                        timed_out = true;
                        kill_process_group(&mut child);
                        let _ = child.wait();
                        break;
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) => {
                    warn!(error = %e, "wait failed, killing process group");
                    kill_process_group(&mut child);
                    let _ = child.wait();
                    break;
                }
            }
        }

        let exit_code = match child.try_wait() {
            Ok(Some(status)) => status.code(),
            _ => None,
        };
        let duration = started.elapsed();

        let (stdout, stdout_truncated) = collect(stdout_handle);
        let (stderr, stderr_truncated) = collect(stderr_handle);

        let result = ExecutionResult {
            exit_code,
            stdout,
            stderr,
            stdout_truncated,
            stderr_truncated,
            duration,
            timed_out,
            dry_run: false,
        };

        let record = AuditRecord::completed(
            session,
            &request.command,
            &admitted.working_dir,
            result.exit_code,
            result.stdout.len() as u64,
            result.stderr.len() as u64,
            duration,
        );
        self.audit.append(&record)?;

        Ok(result)
    }

    fn audit_rejection(
        &self,
        request: &ExecutionRequest,
        session: &str,
        reason: &str,
    ) -> Result<(), AuditError> {
        if request.dry_run {
            return Ok(());
        }
        let working_dir = request
            .working_dir
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| self.validator.sandbox_root().display().to_string());
        self.audit.append(&AuditRecord::rejected(
            session,
            &request.command,
            &working_dir,
            reason,
        ))
    }
}

/// Drain a child stream into a bounded buffer on a dedicated thread. The
/// stream is read to EOF either way so the child never blocks on a full
/// pipe; bytes past the cap are discarded.
fn drain<R: Read + Send + 'static>(
    mut stream: R,
    cap: usize,
) -> thread::JoinHandle<(Vec<u8>, bool)> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let mut truncated = false;
        let mut chunk = [0u8; 8192];

        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    if buf.len() < cap {
                        let take = n.min(cap - buf.len());
                        buf.extend_from_slice(&chunk[..take]);
                        if take < n {
                            truncated = true;
                        }
                    } else {
                        truncated = true;
                    }
                }
                Err(_) => break,
            }
        }

        (buf, truncated)
    })
}

fn collect(handle: Option<thread::JoinHandle<(Vec<u8>, bool)>>) -> (String, bool) {
    let (bytes, truncated) = handle
        .and_then(|h| h.join().ok())
        .unwrap_or((Vec::new(), false));
    (String::from_utf8_lossy(&bytes).into_owned(), truncated)
}

/// Terminate the child's entire process group so no grandchildren survive.
#[cfg(unix)]
fn kill_process_group(child: &mut Child) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = Pid::from_raw(child.id() as i32);
    if killpg(pgid, Signal::SIGKILL).is_err() {
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) {
    let _ = child.kill();
}
