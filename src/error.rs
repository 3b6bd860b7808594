use thiserror::Error;

use crate::audit::AuditError;
use crate::config::ConfigError;
use crate::edit::{BackupError, EditError};
use crate::exec::ExecuteError;
use crate::security::{RateLimitError, ValidationError};
use crate::workflow::WorkflowError;

/// Top-level error for embedders that want a single error type across the
/// whole subsystem.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Rate limit error: {0}")]
    RateLimit(#[from] RateLimitError),

    #[error("Execution error: {0}")]
    Execute(#[from] ExecuteError),

    #[error("Audit error: {0}")]
    Audit(#[from] AuditError),

    #[error("Edit error: {0}")]
    Edit(#[from] EditError),

    #[error("Backup error: {0}")]
    Backup(#[from] BackupError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ExecError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_converts() {
        let err: ExecError = ValidationError::EmptyCommand.into();
        assert!(matches!(err, ExecError::Validation(_)));
        assert!(err.to_string().contains("Validation error"));
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: ExecError = io.into();
        assert!(matches!(err, ExecError::Io(_)));
    }
}
