#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

use execguard::api::ExecService;
use execguard::config::Config;
use execguard::security::{CommandSpec, RiskCategory, Whitelist};

/// Service rooted at a fresh sandbox, with a few extra binaries whitelisted
/// for exercising timeouts and exit codes.
pub fn create_test_service() -> (TempDir, ExecService) {
    let temp = TempDir::new().unwrap();
    let config = Config::default_for_root(temp.path());
    let service = ExecService::with_whitelist(&config, test_whitelist()).unwrap();
    (temp, service)
}

/// The builtin whitelist widened with sleep/true/false.
pub fn test_whitelist() -> Whitelist {
    let mut entries: Vec<CommandSpec> = Whitelist::builtin()
        .entries()
        .into_iter()
        .cloned()
        .collect();
    entries.push(CommandSpec::new("sleep", 2, RiskCategory::Testing, false));
    entries.push(CommandSpec::new("true", 0, RiskCategory::Testing, false));
    entries.push(CommandSpec::new("false", 0, RiskCategory::Testing, false));
    Whitelist::from_entries(entries)
}

/// Helper to create a test git repository
pub fn create_test_repo() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let repo_path = temp_dir.path().to_path_buf();
    init_repo(&repo_path);
    (temp_dir, repo_path)
}

pub fn init_repo(repo_path: &Path) {
    git(repo_path, &["init", "-b", "main"]);
    git(repo_path, &["config", "user.name", "Test User"]);
    git(repo_path, &["config", "user.email", "test@example.com"]);
}

/// Helper to create a commit
pub fn create_commit(repo_path: &Path, file: &str, content: &str, message: &str) {
    fs::write(repo_path.join(file), content).expect("Failed to write file");
    git(repo_path, &["add", file]);
    git(repo_path, &["commit", "-m", message]);
}

/// Bare repository wired up as `origin` of `repo_path`, so pushes have
/// somewhere local to land.
pub fn add_bare_remote(repo_path: &Path) -> TempDir {
    let remote = TempDir::new().unwrap();
    Command::new("git")
        .args(["init", "--bare"])
        .current_dir(remote.path())
        .output()
        .expect("Failed to init bare remote");

    let url = remote.path().display().to_string();
    git(repo_path, &["remote", "add", "origin", &url]);
    remote
}

pub fn git(repo_path: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_path)
        .output()
        .expect("Failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}
