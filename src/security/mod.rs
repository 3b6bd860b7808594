pub mod rate_limit;
pub mod validator;

pub use rate_limit::{RateLimitError, RateLimiter};
pub use validator::{AdmittedCommand, CommandValidator, ValidationError};

use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Shell metacharacters refused anywhere in a command, quoted or not.
///
/// The executor never goes through a shell, so none of these would be
/// interpreted anyway; rejecting them up front keeps chained or redirected
/// commands from ever reaching a spawn. Longer operators come first so the
/// rejection reason names the operator the caller actually wrote.
pub const SHELL_METACHARACTERS: &[&str] = &["&&", "||", ";", "|", "&", "`", "$(", ">", "<"];

/// Tokens refused as any argument of any command, whitelisted or not:
/// deletion, privilege escalation, process kill, disk format, shutdown.
pub const BLOCKED_TOKENS: &[&str] = &[
    "rm", "rmdir", "shred", "unlink", "sudo", "su", "doas", "kill", "pkill", "killall", "dd",
    "shutdown", "reboot", "halt", "poweroff",
];

/// Tokens refused only as the command itself. `init 0` is a SysV shutdown,
/// but `git init` and `cargo init` are ordinary subcommands.
pub const BLOCKED_PROGRAMS: &[&str] = &["init"];

/// Risk classification for whitelisted commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskCategory {
    Safe,
    Moderate,
    VersionControl,
    Testing,
    System,
}

impl RiskCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskCategory::Safe => "safe",
            RiskCategory::Moderate => "moderate",
            RiskCategory::VersionControl => "version_control",
            RiskCategory::Testing => "testing",
            RiskCategory::System => "system",
        }
    }
}

/// One whitelist entry: a binary the subsystem may spawn, and its limits.
#[derive(Debug, Clone, Serialize)]
pub struct CommandSpec {
    pub name: String,
    pub max_args: usize,
    pub category: RiskCategory,
    pub requires_approval: bool,
}

impl CommandSpec {
    pub fn new(
        name: &str,
        max_args: usize,
        category: RiskCategory,
        requires_approval: bool,
    ) -> Self {
        Self {
            name: name.to_string(),
            max_args,
            category,
            requires_approval,
        }
    }
}

/// The positive list of commands permitted to execute at all.
///
/// Loaded once at startup and never mutated afterwards. Adding an entry
/// requires careful security review; the blocked token and metacharacter
/// sets above apply regardless of what is listed here.
pub struct Whitelist {
    entries: HashMap<String, CommandSpec>,
}

impl Whitelist {
    /// The builtin command table.
    pub fn builtin() -> Self {
        use RiskCategory::*;
        let spec = CommandSpec::new;
        Self::from_entries(vec![
            // Read-only inspection
            spec("ls", 8, Safe, false),
            spec("cat", 4, Safe, false),
            spec("head", 6, Safe, false),
            spec("tail", 6, Safe, false),
            spec("grep", 10, Safe, false),
            spec("find", 12, Safe, false),
            spec("wc", 6, Safe, false),
            spec("pwd", 1, Safe, false),
            spec("echo", 16, Safe, false),
            spec("which", 4, Safe, false),
            spec("du", 6, Safe, false),
            spec("df", 4, Safe, false),
            // Filesystem mutation (creation only; deletion is blocked outright)
            spec("mkdir", 6, Moderate, false),
            spec("touch", 6, Moderate, false),
            spec("cp", 8, Moderate, false),
            // Version control
            spec("git", 16, VersionControl, false),
            spec("gh", 16, VersionControl, false),
            // Test runners
            spec("cargo", 12, Testing, false),
            spec("pytest", 12, Testing, false),
            spec("npm", 8, Testing, false),
            // System inspection and control
            spec("journalctl", 8, System, false),
            spec("uptime", 2, System, false),
            spec("free", 2, System, false),
            spec("ps", 4, System, false),
            spec("systemctl", 4, System, true),
        ])
    }

    /// Build a whitelist from explicit entries. Intended for embedders that
    /// need a narrower (or, in tests, a wider) table than the builtin one.
    pub fn from_entries(entries: Vec<CommandSpec>) -> Self {
        let entries = entries
            .into_iter()
            .map(|spec| (spec.name.clone(), spec))
            .collect();
        Self { entries }
    }

    pub fn get(&self, name: &str) -> Option<&CommandSpec> {
        self.entries.get(name)
    }

    /// All entries, sorted by name for stable reporting.
    pub fn entries(&self) -> Vec<&CommandSpec> {
        let mut specs: Vec<&CommandSpec> = self.entries.values().collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }
}

#[derive(Debug, Error)]
pub enum ConfineError {
    #[error("path escapes the sandbox root: {0}")]
    Escapes(PathBuf),

    #[error("path cannot be resolved: {0}")]
    Unresolvable(PathBuf),
}

/// Resolve `requested` (absolute, or relative to `root`) and require the
/// result to stay inside `root` after symlink resolution. Fails closed on
/// traversal and on paths that do not exist.
pub fn confine_path(root: &Path, requested: &Path) -> Result<PathBuf, ConfineError> {
    let root = root
        .canonicalize()
        .map_err(|_| ConfineError::Unresolvable(root.to_path_buf()))?;

    let joined = if requested.is_absolute() {
        requested.to_path_buf()
    } else {
        root.join(requested)
    };

    let resolved = joined
        .canonicalize()
        .map_err(|_| ConfineError::Unresolvable(joined.clone()))?;

    if !resolved.starts_with(&root) {
        return Err(ConfineError::Escapes(requested.to_path_buf()));
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_builtin_whitelist_lookup() {
        let whitelist = Whitelist::builtin();
        assert!(whitelist.get("git").is_some());
        assert!(whitelist.get("ls").is_some());
        assert!(whitelist.get("rm").is_none());
        assert!(whitelist.get("bash").is_none());
    }

    #[test]
    fn test_builtin_whitelist_excludes_blocked_tokens() {
        // The blocked set wins over the whitelist; listing a blocked token
        // would make the table self-contradictory.
        let whitelist = Whitelist::builtin();
        for token in BLOCKED_TOKENS.iter().chain(BLOCKED_PROGRAMS) {
            assert!(
                whitelist.get(token).is_none(),
                "blocked token {} must not be whitelisted",
                token
            );
        }
    }

    #[test]
    fn test_approval_required_entries() {
        let whitelist = Whitelist::builtin();
        let systemctl = whitelist.get("systemctl").unwrap();
        assert!(systemctl.requires_approval);
        assert_eq!(systemctl.category, RiskCategory::System);

        let ls = whitelist.get("ls").unwrap();
        assert!(!ls.requires_approval);
    }

    #[test]
    fn test_entries_sorted() {
        let whitelist = Whitelist::builtin();
        let names: Vec<&str> = whitelist.entries().iter().map(|s| s.name.as_str()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn test_confine_relative_path() {
        let temp = TempDir::new().unwrap();
        let sub = temp.path().join("src");
        std::fs::create_dir(&sub).unwrap();

        let resolved = confine_path(temp.path(), Path::new("src")).unwrap();
        assert!(resolved.ends_with("src"));
    }

    #[test]
    fn test_confine_rejects_traversal() {
        let temp = TempDir::new().unwrap();
        let result = confine_path(temp.path(), Path::new("../../etc"));
        assert!(matches!(
            result,
            Err(ConfineError::Escapes(_)) | Err(ConfineError::Unresolvable(_))
        ));
    }

    #[test]
    fn test_confine_rejects_absolute_outside() {
        let temp = TempDir::new().unwrap();
        let result = confine_path(temp.path(), Path::new("/etc"));
        assert!(matches!(result, Err(ConfineError::Escapes(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_confine_resolves_symlink_escape() {
        let temp = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let link = temp.path().join("link");
        std::os::unix::fs::symlink(outside.path(), &link).unwrap();

        let result = confine_path(temp.path(), Path::new("link"));
        assert!(matches!(result, Err(ConfineError::Escapes(_))));
    }
}
