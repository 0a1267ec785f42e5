//! End-to-end tests for the ipcmux CLI and worker binaries.
//!
//! These spawn real worker processes and exchange frames over their stdio.

#![allow(deprecated)] // Allow deprecated Command::cargo_bin for tests

use assert_cmd::Command;
use predicates::prelude::*;

fn ipcmux() -> Command {
    let worker = assert_cmd::cargo::cargo_bin("ipcmux-worker");
    let mut cmd = Command::cargo_bin("ipcmux").expect("ipcmux binary not built");
    cmd.env("IPCMUX_WORKER_PATH", worker);
    cmd
}

#[test]
fn test_ping_collects_every_reply() {
    ipcmux()
        .args(["ping", "--workers", "3"])
        .assert()
        .success()
        .stdout(predicate::str::contains("3/3 workers replied"))
        .stdout(predicate::str::contains("pong from pid").count(3));
}

#[test]
fn test_ping_with_auto_remove() {
    ipcmux()
        .args(["ping", "--workers", "1", "--auto-remove"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1/1 workers replied"));
}

#[test]
fn test_broadcast_reports_each_worker() {
    ipcmux()
        .args(["broadcast", "--workers", "2", "--op", "42", "--payload", r#"{"x": 1}"#])
        .assert()
        .success()
        .stdout(predicate::str::contains(": ok").count(2))
        .stdout(predicate::str::contains("failed").not());
}

#[test]
fn test_broadcast_rejects_invalid_payload() {
    ipcmux()
        .args(["broadcast", "--op", "1", "--payload", "{not json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid JSON payload"));
}

#[test]
fn test_missing_worker_binary() {
    Command::cargo_bin("ipcmux")
        .expect("ipcmux binary not built")
        .args(["ping", "--worker-path", "/nonexistent/ipcmux-worker"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to spawn"));
}

#[test]
fn test_worker_refuses_to_run_standalone() {
    Command::cargo_bin("ipcmux-worker")
        .expect("ipcmux-worker binary not built")
        .env_remove("IPCMUX_CHANNEL")
        .assert()
        .failure()
        .stderr(predicate::str::contains("must be spawned by an ipcmux parent"));
}
