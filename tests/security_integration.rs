mod helpers;

use std::path::Path;
use std::time::Duration;

use tempfile::TempDir;

use execguard::api::{ExecService, Status};
use execguard::config::Config;
use helpers::{create_test_service, test_whitelist};

#[test]
fn test_whitelisted_command_executes() {
    let (_temp, service) = create_test_service();

    let response = service.execute_command("session-a", "echo hello", None, false, false, None);
    assert_eq!(response.status, Status::Success);
    assert_eq!(response.exit_code, Some(0));
    assert_eq!(response.stdout.trim(), "hello");
}

#[test]
fn test_sudo_rejected_citing_blocked_token() {
    let (_temp, service) = create_test_service();

    let response = service.execute_command("session-a", "sudo whoami", None, false, false, None);
    assert_eq!(response.status, Status::Error);
    assert!(response.error.as_deref().unwrap().contains("sudo"));

    // The rejection itself is on the audit trail.
    let audit = service.audit_logs(10);
    assert_eq!(audit.records.len(), 1);
    assert_eq!(audit.records[0].command, "sudo whoami");
    assert!(audit.records[0].rejection_reason.is_some());
}

#[test]
fn test_injection_attempts_rejected() {
    let (_temp, service) = create_test_service();

    for command in [
        "ls; cat /etc/passwd",
        "echo hi && sudo id",
        "cat data | grep secret",
        "echo $(whoami)",
        "echo `whoami`",
        "echo data > /etc/passwd",
    ] {
        let response = service.execute_command("session-a", command, None, false, false, None);
        assert_eq!(response.status, Status::Error, "should reject: {}", command);
    }
}

#[test]
fn test_rate_limit_rejects_request_n_plus_one() {
    let temp = TempDir::new().unwrap();
    let mut config = Config::default_for_root(temp.path());
    config.rate_limit.max_commands = 3;
    let service = ExecService::with_whitelist(&config, test_whitelist()).unwrap();

    for i in 0..3 {
        let response =
            service.execute_command("session-a", "echo ok", None, false, false, None);
        assert_eq!(response.status, Status::Success, "request {} admitted", i);
    }

    let response = service.execute_command("session-a", "echo ok", None, false, false, None);
    assert_eq!(response.status, Status::Error);
    assert!(response.error.as_deref().unwrap().contains("Rate limit"));

    // Another session is unaffected.
    let response = service.execute_command("session-b", "echo ok", None, false, false, None);
    assert_eq!(response.status, Status::Success);
}

#[test]
fn test_exactly_one_audit_record_per_call() {
    let (_temp, service) = create_test_service();

    service.execute_command("session-a", "echo one", None, false, false, None);
    service.execute_command("session-a", "sudo two", None, false, false, None);
    service.execute_command("session-a", "false", None, false, false, None);

    let audit = service.audit_logs(100);
    assert_eq!(audit.records.len(), 3);
}

#[test]
fn test_dry_run_validates_without_executing() {
    let (temp, service) = create_test_service();

    let ok = service.execute_command("session-a", "touch marker", None, true, false, None);
    assert_eq!(ok.status, Status::Success);
    assert!(ok.dry_run);
    assert!(!temp.path().join("marker").exists());

    let rejected = service.execute_command("session-a", "sudo id", None, true, false, None);
    assert_eq!(rejected.status, Status::Error);

    // Dry runs consume no rate budget and leave no audit records.
    assert!(service.audit_logs(10).records.is_empty());
    assert_eq!(service.executor().limiter().in_window("session-a"), 0);
}

#[test]
fn test_timeout_reported_as_timeout_status() {
    let (_temp, service) = create_test_service();

    let response = service.execute_command("session-a", "sleep 5", None, false, false, Some(1));
    assert_eq!(response.status, Status::Timeout);

    // Timed-out calls are audited too.
    assert_eq!(service.audit_logs(10).records.len(), 1);
}

#[test]
fn test_working_dir_confinement() {
    let (_temp, service) = create_test_service();

    let response = service.execute_command(
        "session-a",
        "ls",
        Some(Path::new("/etc")),
        false,
        false,
        None,
    );
    assert_eq!(response.status, Status::Error);

    let response = service.execute_command(
        "session-a",
        "ls",
        Some(Path::new("../..")),
        false,
        false,
        None,
    );
    assert_eq!(response.status, Status::Error);
}

#[test]
fn test_approval_gate_round_trip() {
    let (_temp, service) = create_test_service();

    let denied =
        service.execute_command("session-a", "systemctl status", None, false, false, None);
    assert_eq!(denied.status, Status::Error);
    assert!(denied.error.as_deref().unwrap().contains("approval"));

    let granted =
        service.execute_command("session-a", "systemctl status", None, false, true, None);
    // With approval the command reaches the spawn stage; it may still fail
    // at runtime on hosts without systemd, which is fine.
    assert_ne!(granted.error.as_deref().unwrap_or(""), denied.error.as_deref().unwrap());
}

#[test]
fn test_whitelist_report_matches_validator() {
    let (_temp, service) = create_test_service();

    let report = service.command_whitelist();
    assert!(report.commands.iter().any(|c| c.name == "git"));
    assert!(report.commands.iter().any(|c| c.name == "cargo"));
    assert!(!report.commands.iter().any(|c| c.name == "rm"));

    let systemctl = report
        .commands
        .iter()
        .find(|c| c.name == "systemctl")
        .unwrap();
    assert!(systemctl.requires_approval);

    assert_eq!(report.rate_limit.max_commands, 15);
    assert_eq!(report.rate_limit.window_seconds, 60);
}

#[test]
fn test_output_truncation_cap() {
    let temp = TempDir::new().unwrap();
    let mut config = Config::default_for_root(temp.path());
    config.executor.max_output_bytes = 32;
    let service = ExecService::with_whitelist(&config, test_whitelist()).unwrap();

    let response = service.execute_command(
        "session-a",
        "echo aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
        None,
        false,
        false,
        None,
    );
    assert_eq!(response.status, Status::Success);
    assert!(response.stdout_truncated);
    assert_eq!(response.stdout.len(), 32);
}

#[test]
fn test_rate_window_slides() {
    let temp = TempDir::new().unwrap();
    let mut config = Config::default_for_root(temp.path());
    config.rate_limit.max_commands = 1;
    config.rate_limit.window_seconds = 1;
    let service = ExecService::with_whitelist(&config, test_whitelist()).unwrap();

    assert_eq!(
        service
            .execute_command("session-a", "echo ok", None, false, false, None)
            .status,
        Status::Success
    );
    assert_eq!(
        service
            .execute_command("session-a", "echo ok", None, false, false, None)
            .status,
        Status::Error
    );

    std::thread::sleep(Duration::from_millis(1100));
    assert_eq!(
        service
            .execute_command("session-a", "echo ok", None, false, false, None)
            .status,
        Status::Success
    );
}
