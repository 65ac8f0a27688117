//! CLI integration tests for audit-backfill.
//!
//! These tests verify command-line argument parsing, help output,
//! and exit codes for various error conditions.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use tempfile::NamedTempFile;

/// Get a command for the audit-backfill binary.
fn cmd() -> Command {
    Command::cargo_bin("audit-backfill").unwrap()
}

/// Config that needs no network for validation and enqueueing.
fn offline_config() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
source:
  host: db.internal
  user: backfill
  password: hunter2
sink:
  type: memory
queue:
  type: memory
backfill:
  cutover: "2021-10-01T00:00:00Z"
  window_minutes: 30
tenants:
  - org: acme
    pod: pod-1
    tenant_id: t-1
"#
    )
    .unwrap();
    file
}

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("enqueue"))
        .stdout(predicate::str::contains("worker"))
        .stdout(predicate::str::contains("count"))
        .stdout(predicate::str::contains("validate"));
}

#[test]
fn test_run_subcommand_help() {
    cmd()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--org"))
        .stdout(predicate::str::contains("--pod"))
        .stdout(predicate::str::contains("--tenant-id"));
}

#[test]
fn test_count_subcommand_help() {
    cmd()
        .args(["count", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--from"))
        .stdout(predicate::str::contains("--to"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("audit-backfill"));
}

#[test]
fn test_global_flags_have_defaults() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--output-json"))
        .stdout(predicate::str::contains("[default: text]"))
        .stdout(predicate::str::contains("[default: info]"))
        .stdout(predicate::str::contains("[default: config.yaml]"));
}

// =============================================================================
// Exit Code Tests
// =============================================================================

#[test]
fn test_missing_config_exits_with_code_1() {
    cmd()
        .args(["--config", "nonexistent_config_file.yaml", "validate"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("IO error"));
}

#[test]
fn test_invalid_yaml_exits_with_code_2() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "invalid: yaml: content: [").unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "validate"])
        .assert()
        .code(2);
}

#[test]
fn test_missing_source_host_exits_with_code_2() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "source:").unwrap();
    writeln!(file, "  user: backfill").unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "validate"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("host"));
}

#[test]
fn test_bad_window_exits_with_code_2() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "source:\n  host: db\n  user: u").unwrap();
    writeln!(file, "backfill:\n  window_minutes: 7").unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "validate"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("window_minutes"));
}

// =============================================================================
// Command Tests
// =============================================================================

#[test]
fn test_validate_accepts_offline_config() {
    let config = offline_config();
    cmd()
        .args(["--config", config.path().to_str().unwrap(), "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid (1 tenants"));
}

#[test]
fn test_validate_never_prints_password() {
    let config = offline_config();
    cmd()
        .args([
            "--config",
            config.path().to_str().unwrap(),
            "--verbosity",
            "debug",
            "validate",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("hunter2").not())
        .stderr(predicate::str::contains("hunter2").not());
}

#[test]
fn test_verbosity_filters_info_logs() {
    let config = offline_config();
    cmd()
        .env_remove("RUST_LOG")
        .args([
            "--config",
            config.path().to_str().unwrap(),
            "--verbosity",
            "warn",
            "validate",
        ])
        .assert()
        .success()
        .stderr(predicate::str::contains("Loaded configuration").not());
}

#[test]
fn test_rust_log_overrides_verbosity() {
    let config = offline_config();
    cmd()
        .env("RUST_LOG", "info")
        .args([
            "--config",
            config.path().to_str().unwrap(),
            "--verbosity",
            "warn",
            "validate",
        ])
        .assert()
        .success()
        .stderr(predicate::str::contains("Loaded configuration"));
}

#[test]
fn test_enqueue_configured_tenant() {
    let config = offline_config();
    cmd()
        .args(["--config", config.path().to_str().unwrap(), "enqueue", "--org", "acme"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Queued acme@pod-1"));
}

#[test]
fn test_enqueue_unknown_org_exits_with_code_2() {
    let config = offline_config();
    cmd()
        .args(["--config", config.path().to_str().unwrap(), "enqueue", "--org", "initech"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("initech"));
}

#[test]
fn test_run_unknown_org_exits_with_code_2() {
    let config = offline_config();
    cmd()
        .args(["--config", config.path().to_str().unwrap(), "run", "--org", "initech"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("--tenant-id"));
}

#[test]
fn test_pod_requires_tenant_id() {
    cmd()
        .args(["run", "--org", "initech", "--pod", "pod-9"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--tenant-id"));
}

#[test]
fn test_count_rejects_bad_timestamp() {
    cmd()
        .args(["count", "--org", "acme", "--from", "yesterday", "--to", "2020-01-01T00:00:00Z"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--from"));
}

// =============================================================================
// No Subcommand Tests
// =============================================================================

#[test]
fn test_no_subcommand_shows_help() {
    cmd()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}
