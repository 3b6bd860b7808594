use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::exec::tokenize;
use crate::security::{
    BLOCKED_PROGRAMS, BLOCKED_TOKENS, CommandSpec, ConfineError, SHELL_METACHARACTERS, Whitelist,
    confine_path,
};

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Empty command")]
    EmptyCommand,

    #[error("Command not whitelisted: {0}")]
    UnknownCommand(String),

    #[error("Too many arguments for '{command}': {given} (max {max})")]
    TooManyArgs {
        command: String,
        given: usize,
        max: usize,
    },

    #[error("Command contains blocked token: {0}")]
    BlockedToken(String),

    #[error("Command contains shell metacharacter: {0}")]
    ShellMetacharacter(String),

    #[error("Unbalanced quoting in command")]
    UnbalancedQuotes,

    #[error("Working directory escapes the sandbox root: {0}")]
    SandboxViolation(PathBuf),

    #[error("Working directory cannot be resolved: {0}")]
    UnresolvableWorkingDir(PathBuf),
}

/// A command that passed every validation check and is ready to spawn.
#[derive(Debug, Clone)]
pub struct AdmittedCommand {
    pub raw: String,
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub spec: CommandSpec,
}

/// Validates raw command text against the whitelist, the blocked pattern
/// set, and the sandbox boundary. Validation is pure: no process is spawned
/// and nothing is written, so the same path serves dry runs.
pub struct CommandValidator {
    whitelist: Whitelist,
    sandbox_root: PathBuf,
}

impl CommandValidator {
    pub fn new<P: AsRef<Path>>(whitelist: Whitelist, sandbox_root: P) -> Self {
        Self {
            whitelist,
            sandbox_root: sandbox_root.as_ref().to_path_buf(),
        }
    }

    /// Validate a command, short-circuiting on the first failing check.
    ///
    /// Blocked patterns are checked before the whitelist so a rejection of
    /// e.g. `sudo whoami` names the blocked token rather than a generic
    /// whitelist miss.
    pub fn validate(
        &self,
        command: &str,
        working_dir: Option<&Path>,
    ) -> Result<AdmittedCommand, ValidationError> {
        let command = command.trim();

        if command.is_empty() {
            return Err(ValidationError::EmptyCommand);
        }

        self.check_metacharacters(command)?;

        let tokens = tokenize(command).map_err(|_| ValidationError::UnbalancedQuotes)?;
        if tokens.is_empty() {
            return Err(ValidationError::EmptyCommand);
        }

        self.check_blocked_tokens(&tokens)?;

        let program = tokens[0].clone();
        let spec = self
            .whitelist
            .get(&program)
            .ok_or_else(|| ValidationError::UnknownCommand(program.clone()))?
            .clone();

        let given = tokens.len() - 1;
        if given > spec.max_args {
            return Err(ValidationError::TooManyArgs {
                command: program,
                given,
                max: spec.max_args,
            });
        }

        let working_dir = self.resolve_working_dir(working_dir)?;

        Ok(AdmittedCommand {
            raw: command.to_string(),
            program,
            args: tokens[1..].to_vec(),
            working_dir,
            spec,
        })
    }

    pub fn whitelist(&self) -> &Whitelist {
        &self.whitelist
    }

    pub fn sandbox_root(&self) -> &Path {
        &self.sandbox_root
    }

    /// Scan the raw text for chaining and substitution operators. These are
    /// rejected even inside quotes: quoting is honored by the tokenizer, but
    /// a request carrying them is suspicious enough to fail closed.
    fn check_metacharacters(&self, command: &str) -> Result<(), ValidationError> {
        for op in SHELL_METACHARACTERS {
            if command.contains(op) {
                return Err(ValidationError::ShellMetacharacter(op.to_string()));
            }
        }
        Ok(())
    }

    fn check_blocked_tokens(&self, tokens: &[String]) -> Result<(), ValidationError> {
        if let Some(program) = tokens.first()
            && BLOCKED_PROGRAMS.iter().any(|blocked| program == blocked)
        {
            return Err(ValidationError::BlockedToken(program.clone()));
        }
        for token in tokens {
            if BLOCKED_TOKENS.iter().any(|blocked| token == blocked) {
                return Err(ValidationError::BlockedToken(token.clone()));
            }
            // mkfs ships as mkfs.ext4, mkfs.xfs, etc.
            if token.starts_with("mkfs") {
                return Err(ValidationError::BlockedToken(token.clone()));
            }
        }
        Ok(())
    }

    /// Resolve the requested working directory (defaulting to the sandbox
    /// root) and require it to stay inside the sandbox after symlink
    /// resolution.
    fn resolve_working_dir(&self, requested: Option<&Path>) -> Result<PathBuf, ValidationError> {
        let requested = requested.unwrap_or(Path::new("."));
        confine_path(&self.sandbox_root, requested).map_err(|e| match e {
            ConfineError::Escapes(path) => ValidationError::SandboxViolation(path),
            ConfineError::Unresolvable(path) => ValidationError::UnresolvableWorkingDir(path),
        })
    }
}
