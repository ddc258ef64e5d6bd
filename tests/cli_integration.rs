use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use assert_cmd::prelude::*;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::tempdir;

const TIME_LOG: &str = "\
## 2024-01-15
- Issue #42 [2.5h] @alice
- Review #7 [45m] @bob
## 2024-01-16
- Issue #42 [1h 30m] @alice
";

fn timeport(root: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("timeport"));
    cmd.arg("--root").arg(root).env("NO_COLOR", "1").env_remove("RUST_LOG");
    cmd
}

fn run(root: &Path, args: &[&str]) -> Output {
    timeport(root)
        .args(args)
        .output()
        .expect("timeport command executes")
}

fn stdout_json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("stdout should contain JSON")
}

fn stderr_json(output: &Output) -> Value {
    serde_json::from_slice(&output.stderr).expect("stderr should contain JSON")
}

#[test]
fn dry_run_reports_counts_and_writes_nothing() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("TIME.md"), TIME_LOG).unwrap();

    let output = run(dir.path(), &["migrate", "dry-run", "--no-blame", "--batch-size", "2"]);
    assert!(output.status.success());
    let report = stdout_json(&output);
    assert_eq!(report["sessions"], 3);
    assert_eq!(report["total_minutes"], 285);
    assert_eq!(report["batches"], 2);
    assert_eq!(report["format_detected"], "freeform");
    assert!(!dir.path().join(".flowforge").exists());
}

#[test]
fn execute_then_validate_succeeds() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("TIME.md"), TIME_LOG).unwrap();

    let output = run(dir.path(), &["migrate", "execute", "--no-blame"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let outcome = stdout_json(&output);
    assert_eq!(outcome["status"], "committed");
    assert_eq!(outcome["total_minutes"], 285);
    assert_eq!(outcome["validation"]["passed"], true);

    timeport(dir.path())
        .args(["migrate", "validate", "--no-blame"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"billing_accuracy\": 100.0"));
}

#[test]
fn pretty_validate_prints_category_summary() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("TIME.md"), TIME_LOG).unwrap();
    run(dir.path(), &["migrate", "execute", "--no-blame"]);

    timeport(dir.path())
        .args(["--pretty", "migrate", "validate", "--no-blame"])
        .assert()
        .success()
        .stdout(predicate::str::contains("billing"))
        .stdout(predicate::str::contains("PASSED: 5/5 checks passed"));
}

#[test]
fn corruption_exits_2_with_json_error() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("TIME.md"), "## 2024-01-15\n- Bad #999999 [1h] @alice\n").unwrap();

    let output = run(dir.path(), &["migrate", "execute", "--no-blame"]);
    assert_eq!(output.status.code(), Some(2));
    let err = stderr_json(&output);
    assert_eq!(err["error"], "corrupted_source");
    assert_eq!(err["kind"], "corruption");
    assert!(err["message"].as_str().unwrap().contains("line 2"));
    assert!(!dir.path().join(".flowforge/billing").exists());
}

#[test]
fn tampered_output_fails_validation_with_exit_3() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("TIME.md"), TIME_LOG).unwrap();
    run(dir.path(), &["migrate", "execute", "--no-blame"]);
    fs::remove_file(dir.path().join(".flowforge/users/bob/time.json")).unwrap();

    let output = run(dir.path(), &["migrate", "validate", "--no-blame"]);
    assert_eq!(output.status.code(), Some(3));
    assert_eq!(stdout_json(&output)["passed"], false);
    assert_eq!(stderr_json(&output)["error"], "validation_failed");
}

#[test]
fn halted_execute_requires_resume() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("TIME.md"), TIME_LOG).unwrap();

    let output = run(
        dir.path(),
        &["migrate", "execute", "--no-blame", "--batch-size", "1", "--halt-after", "1"],
    );
    assert!(output.status.success());
    assert_eq!(stdout_json(&output)["status"], "halted");

    let output = run(dir.path(), &["migrate", "execute", "--no-blame"]);
    assert_eq!(output.status.code(), Some(1));
    assert_eq!(stderr_json(&output)["error"], "pending_checkpoint");

    let output = run(dir.path(), &["migrate", "resume", "--no-blame"]);
    assert!(output.status.success());
    let outcome = stdout_json(&output);
    assert_eq!(outcome["status"], "committed");
    assert_eq!(outcome["resumed_from_batch"], 1);
    assert_eq!(outcome["sessions_migrated"], 3);
}

#[test]
fn resume_without_checkpoint_honours_run_flags() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("TIME.md"), TIME_LOG).unwrap();

    let output = run(
        dir.path(),
        &["migrate", "resume", "--no-blame", "--batch-size", "1", "--anonymize"],
    );
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let outcome = stdout_json(&output);
    assert_eq!(outcome["status"], "committed");
    assert_eq!(outcome["total_batches"], 3);
    assert!(!dir.path().join(".flowforge/users/alice").exists());
}

#[test]
fn rollback_and_backups_listing() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("TIME.md"), TIME_LOG).unwrap();
    run(dir.path(), &["migrate", "execute", "--no-blame"]);

    let output = run(dir.path(), &["backups"]);
    assert!(output.status.success());
    let listing = stdout_json(&output);
    assert_eq!(listing.as_array().unwrap().len(), 1);
    assert_eq!(listing[0]["sources"], 1);
    let backup_id = listing[0]["backup_id"].as_str().unwrap().to_string();

    let output = run(dir.path(), &["migrate", "rollback", "--backup", backup_id.as_str()]);
    assert!(output.status.success());
    assert_eq!(stdout_json(&output)["backup_id"], backup_id.as_str());
    assert!(!dir.path().join(".flowforge/billing/time-tracking.json").exists());

    timeport(dir.path())
        .args(["migrate", "rollback", "--backup", "nope"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("backup_not_found"));
}

#[test]
fn unlock_without_lock_reports_not_locked() {
    let dir = tempdir().unwrap();
    timeport(dir.path())
        .arg("unlock")
        .assert()
        .failure()
        .stderr(predicate::str::contains("not_locked"));
}

#[test]
fn unlock_removes_abandoned_lock_file() {
    let dir = tempdir().unwrap();
    let lock = dir.path().join(".flowforge/migration/migration.lock");
    fs::create_dir_all(lock.parent().unwrap()).unwrap();
    fs::write(&lock, r#"{"pid":1,"host":"elsewhere","command":"migrate execute","acquired_at":"2024-01-01T00:00:00Z"}"#).unwrap();

    let output = run(dir.path(), &["unlock"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(stdout_json(&output)["held"], false);
    assert!(!lock.exists());
}

#[test]
fn invalid_batch_size_is_rejected() {
    let dir = tempdir().unwrap();
    timeport(dir.path())
        .args(["migrate", "dry-run", "--batch-size", "0"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("invalid_config"));
}
