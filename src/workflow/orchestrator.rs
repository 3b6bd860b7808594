use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::exec::{ExecutionRequest, ExecutionResult, SandboxExecutor, quote};

pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(300);

/// The stages of the publication workflow, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStep {
    CheckClean,
    CreateBranch,
    RunTests,
    Stage,
    Commit,
    Publish,
    PublicationRequest,
}

impl fmt::Display for WorkflowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CheckClean => "check_clean",
            Self::CreateBranch => "create_branch",
            Self::RunTests => "run_tests",
            Self::Stage => "stage",
            Self::Commit => "commit",
            Self::Publish => "publish",
            Self::PublicationRequest => "publication_request",
        };
        f.write_str(name)
    }
}

/// A workflow halts at the first failing step. `last_completed` tells the
/// caller how far it got; nothing is undone automatically.
#[derive(Debug, Error)]
#[error("Workflow failed at {step}: {message}")]
pub struct WorkflowError {
    pub step: WorkflowStep,
    pub last_completed: Option<WorkflowStep>,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowParams {
    pub feature_name: String,
    pub commit_message: String,
    #[serde(default)]
    pub pr_title: Option<String>,
    #[serde(default)]
    pub pr_body: Option<String>,
    /// Files to stage; empty means stage everything.
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default = "default_run_tests")]
    pub run_tests: bool,
    #[serde(default)]
    pub base_branch: Option<String>,
}

fn default_run_tests() -> bool {
    true
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowResult {
    pub branch: String,
    pub commit: String,
    pub publication_url: Option<String>,
    pub steps_completed: Vec<WorkflowStep>,
}

/// Drives the branch-test-commit-push sequence through the executor, so
/// every git invocation is validated, rate limited, and audited like any
/// other command.
pub struct WorkflowOrchestrator<'a> {
    executor: &'a SandboxExecutor,
    repo_path: PathBuf,
    test_command: String,
    test_timeout: Duration,
}

impl<'a> WorkflowOrchestrator<'a> {
    pub fn new<P: AsRef<Path>>(executor: &'a SandboxExecutor, repo_path: P) -> Self {
        Self {
            executor,
            repo_path: repo_path.as_ref().to_path_buf(),
            test_command: "cargo test".to_string(),
            test_timeout: DEFAULT_TEST_TIMEOUT,
        }
    }

    pub fn test_command(mut self, command: &str) -> Self {
        self.test_command = command.to_string();
        self
    }

    pub fn test_timeout(mut self, timeout: Duration) -> Self {
        self.test_timeout = timeout;
        self
    }

    /// Run the full workflow for `session`. Steps execute in order and the
    /// first failure aborts the rest.
    pub fn run(
        &self,
        session: &str,
        params: &WorkflowParams,
    ) -> Result<WorkflowResult, WorkflowError> {
        let mut progress = Progress::new();

        let status = self.step(session, WorkflowStep::CheckClean, "git status --porcelain", &progress)?;
        check_workable(&status).map_err(|message| progress.fail(WorkflowStep::CheckClean, message))?;
        progress.complete(WorkflowStep::CheckClean);

        let branch = branch_name(&params.feature_name);
        let checkout = match &params.base_branch {
            Some(base) => format!("git checkout -b {} {}", quote(&branch), quote(base)),
            None => format!("git checkout -b {}", quote(&branch)),
        };
        self.step(session, WorkflowStep::CreateBranch, &checkout, &progress)?;
        progress.complete(WorkflowStep::CreateBranch);
        info!(branch = %branch, "created workflow branch");

        if params.run_tests {
            self.run_tests(session, &progress)?;
            progress.complete(WorkflowStep::RunTests);
        }

        let stage = if params.files.is_empty() {
            "git add -A".to_string()
        } else {
            let mut cmd = String::from("git add");
            for file in &params.files {
                cmd.push(' ');
                cmd.push_str(&quote(file));
            }
            cmd
        };
        self.step(session, WorkflowStep::Stage, &stage, &progress)?;
        progress.complete(WorkflowStep::Stage);

        let commit = format!("git commit -m {}", quote(&params.commit_message));
        self.step(session, WorkflowStep::Commit, &commit, &progress)?;
        let head = self.step(session, WorkflowStep::Commit, "git rev-parse HEAD", &progress)?;
        let commit_sha = head.stdout.trim().to_string();
        progress.complete(WorkflowStep::Commit);

        let push = format!("git push -u origin {}", quote(&branch));
        self.step(session, WorkflowStep::Publish, &push, &progress)?;
        progress.complete(WorkflowStep::Publish);

        let publication_url = match &params.pr_title {
            Some(title) => {
                let url = self.open_publication(session, params, title, &progress)?;
                progress.complete(WorkflowStep::PublicationRequest);
                url
            }
            None => None,
        };

        Ok(WorkflowResult {
            branch,
            commit: commit_sha,
            publication_url,
            steps_completed: progress.completed,
        })
    }

    fn run_tests(&self, session: &str, progress: &Progress) -> Result<(), WorkflowError> {
        let request = ExecutionRequest::new(&self.test_command)
            .working_dir(&self.repo_path)
            .timeout(self.test_timeout);

        debug!(command = %self.test_command, "running test suite");
        let result = self
            .executor
            .execute(&request, session)
            .map_err(|e| progress.fail(WorkflowStep::RunTests, e.to_string()))?;

        if !result.success() {
            return Err(progress.fail(WorkflowStep::RunTests, failure_message(&result)));
        }

        Ok(())
    }

    fn open_publication(
        &self,
        session: &str,
        params: &WorkflowParams,
        title: &str,
        progress: &Progress,
    ) -> Result<Option<String>, WorkflowError> {
        let mut command = format!("gh pr create --title {}", quote(title));
        if let Some(body) = &params.pr_body {
            command.push_str(&format!(" --body {}", quote(body)));
        }
        if let Some(base) = &params.base_branch {
            command.push_str(&format!(" --base {}", quote(base)));
        }

        let result = self.step(session, WorkflowStep::PublicationRequest, &command, progress)?;
        let url = result
            .stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .map(|line| line.trim().to_string());
        Ok(url)
    }

    /// Run one workflow command through the executor and require success.
    fn step(
        &self,
        session: &str,
        step: WorkflowStep,
        command: &str,
        progress: &Progress,
    ) -> Result<ExecutionResult, WorkflowError> {
        let request = ExecutionRequest::new(command).working_dir(&self.repo_path);

        let result = self
            .executor
            .execute(&request, session)
            .map_err(|e| progress.fail(step, e.to_string()))?;

        if !result.success() {
            return Err(progress.fail(step, failure_message(&result)));
        }

        Ok(result)
    }
}

struct Progress {
    completed: Vec<WorkflowStep>,
}

impl Progress {
    fn new() -> Self {
        Self {
            completed: Vec::new(),
        }
    }

    fn complete(&mut self, step: WorkflowStep) {
        self.completed.push(step);
    }

    fn fail(&self, step: WorkflowStep, message: String) -> WorkflowError {
        WorkflowError {
            step,
            last_completed: self.completed.last().copied(),
            message,
        }
    }
}

/// A workflow needs something to commit and no unresolved merge state.
fn check_workable(status: &ExecutionResult) -> Result<(), String> {
    let output = status.stdout.trim();
    if output.is_empty() {
        return Err("nothing to commit: working tree is clean".to_string());
    }
    for line in output.lines() {
        let code = line.get(..2).unwrap_or("");
        if code == "UU" || code == "AA" || code == "DD" {
            return Err(format!("unresolved merge entry: {}", line.trim()));
        }
    }
    Ok(())
}

fn failure_message(result: &ExecutionResult) -> String {
    if result.timed_out {
        return "command timed out".to_string();
    }
    let stderr = result.stderr.trim();
    if stderr.is_empty() {
        format!("exit code {:?}", result.exit_code)
    } else {
        format!("exit code {:?}: {}", result.exit_code, stderr)
    }
}

fn branch_name(feature_name: &str) -> String {
    format!(
        "agent/{}-{}",
        slugify(feature_name),
        Utc::now().format("%Y%m%d-%H%M%S")
    )
}

/// Lowercase alphanumerics with single-hyphen separators; anything else is
/// collapsed away.
fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_hyphen = false;

    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_hyphen = true;
        }
    }

    if slug.is_empty() {
        slug.push_str("feature");
    }
    slug
}
