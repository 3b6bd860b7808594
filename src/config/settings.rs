use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub sandbox: SandboxConfig,
    pub rate_limit: RateLimitConfig,
    pub executor: ExecutorConfig,
    pub workflow: WorkflowConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SandboxConfig {
    /// Root directory all commands and edits are confined to.
    pub root: PathBuf,
    pub audit_log: PathBuf,
    pub backup_dir: PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RateLimitConfig {
    pub max_commands: usize,
    pub window_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ExecutorConfig {
    pub timeout_seconds: u64,
    pub max_output_bytes: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WorkflowConfig {
    pub test_command: String,
    pub test_timeout_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_base_branch: Option<String>,
}

impl Config {
    /// Default configuration rooted at `root`; state lives under a hidden
    /// directory inside the sandbox.
    pub fn default_for_root<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref().to_path_buf();
        let state_dir = root.join(".execguard");

        Config {
            sandbox: SandboxConfig {
                audit_log: state_dir.join("audit.log"),
                backup_dir: state_dir.join("backups"),
                root,
            },
            rate_limit: RateLimitConfig {
                max_commands: 15,
                window_seconds: 60,
            },
            executor: ExecutorConfig {
                timeout_seconds: 30,
                max_output_bytes: 1024 * 1024,
            },
            workflow: WorkflowConfig {
                test_command: "cargo test".to_string(),
                test_timeout_seconds: 300,
                default_base_branch: None,
            },
        }
    }

    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&contents)?;

        config.validate()?;

        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        // Validate before saving
        self.validate()?;

        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;

        // Set permissions to 600 (owner read/write only)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(path, perms)?;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sandbox.root.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue(
                "sandbox root must not be empty".to_string(),
            ));
        }

        if !self.sandbox.root.is_absolute() {
            return Err(ConfigError::InvalidValue(format!(
                "sandbox root must be an absolute path: {}",
                self.sandbox.root.display()
            )));
        }

        if self.rate_limit.max_commands == 0 {
            return Err(ConfigError::InvalidValue(
                "max_commands must be greater than 0".to_string(),
            ));
        }

        if self.rate_limit.window_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "window_seconds must be greater than 0".to_string(),
            ));
        }

        if self.executor.timeout_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "timeout_seconds must be greater than 0".to_string(),
            ));
        }

        if self.executor.max_output_bytes == 0 {
            return Err(ConfigError::InvalidValue(
                "max_output_bytes must be greater than 0".to_string(),
            ));
        }

        if self.workflow.test_command.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "test_command must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default_for_root("/sandbox");
        assert_eq!(config.sandbox.root, PathBuf::from("/sandbox"));
        assert_eq!(
            config.sandbox.audit_log,
            PathBuf::from("/sandbox/.execguard/audit.log")
        );
        assert_eq!(config.rate_limit.max_commands, 15);
        assert_eq!(config.rate_limit.window_seconds, 60);
        assert_eq!(config.executor.timeout_seconds, 30);
    }

    #[test]
    fn test_validate_valid_config() {
        let config = Config::default_for_root("/sandbox");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_relative_root() {
        let mut config = Config::default_for_root("/sandbox");
        config.sandbox.root = PathBuf::from("relative/path");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_rate_limit() {
        let mut config = Config::default_for_root("/sandbox");
        config.rate_limit.max_commands = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_timeout() {
        let mut config = Config::default_for_root("/sandbox");
        config.executor.timeout_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_empty_test_command() {
        let mut config = Config::default_for_root("/sandbox");
        config.workflow.test_command = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");

        let config = Config::default_for_root("/sandbox");
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.sandbox.root, config.sandbox.root);
        assert_eq!(loaded.rate_limit.max_commands, config.rate_limit.max_commands);
        assert_eq!(loaded.workflow.test_command, config.workflow.test_command);
    }

    #[cfg(unix)]
    #[test]
    fn test_saved_config_has_restricted_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        Config::default_for_root("/sandbox").save(&path).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");

        let mut config = Config::default_for_root("/sandbox");
        config.save(&path).unwrap();

        // Corrupt the saved file with an out-of-range value.
        let contents = fs::read_to_string(&path)
            .unwrap()
            .replace("max_commands = 15", "max_commands = 0");
        fs::write(&path, contents).unwrap();

        assert!(matches!(
            Config::load(&path),
            Err(ConfigError::InvalidValue(_))
        ));
    }
}
