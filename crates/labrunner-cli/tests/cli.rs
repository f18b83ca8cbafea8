//! End-to-end tests for the `labrunner` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn labrunner() -> Command {
    Command::cargo_bin("labrunner").unwrap()
}

fn script(dir: &TempDir, name: &str, code: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, code).unwrap();
    path
}

#[test]
fn test_help_lists_subcommands() {
    labrunner()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("check"));
}

#[test]
fn test_check_accepts_valid_script() {
    let dir = TempDir::new().unwrap();
    let path = script(&dir, "ok.txt", "def double(x):\n    return x * 2\nprint(double(21))\n");

    labrunner()
        .arg("check")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("ok"));
}

#[test]
fn test_check_reports_syntax_error_with_line() {
    let dir = TempDir::new().unwrap();
    let good = script(&dir, "good.txt", "x = 1\n");
    let bad = script(&dir, "bad.txt", "x = 1\nif x\n    pass\n");

    labrunner()
        .arg("check")
        .arg(&good)
        .arg(&bad)
        .assert()
        .failure()
        .stdout(predicate::str::contains("bad.txt:2"))
        .stdout(predicate::str::contains("1 of 2 files failed to parse"));
}

#[test]
fn test_check_missing_file_fails() {
    labrunner()
        .args(["check", "/nonexistent/script.txt"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read"));
}

#[test]
fn test_run_requires_files() {
    labrunner().arg("run").assert().failure();
}

#[test]
#[ignore = "Requires labrunner-worker binary"]
fn test_run_relays_output_and_reports_failures() {
    let dir = TempDir::new().unwrap();
    let ok = script(&dir, "hello.txt", "print('hello ' + who)\n");
    let bad = script(&dir, "bad.txt", "raise ValueError('boom')\n");

    labrunner()
        .arg("run")
        .arg(&ok)
        .arg(&bad)
        .args(["--poll-ms", "20", "--global", "who=world"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("hello world"))
        .stderr(predicate::str::contains("ValueError: boom"));
}

#[test]
#[ignore = "Requires labrunner-worker binary"]
fn test_run_stops_scripts_after_timeout() {
    let dir = TempDir::new().unwrap();
    let spin = script(&dir, "spin.txt", "while True:\n    sleep(0.01)\n");

    labrunner()
        .arg("run")
        .arg(&spin)
        .args(["--timeout", "0.5", "--poll-ms", "20"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("timed out"));
}

#[test]
fn test_run_rejects_unusable_timeout() {
    let dir = TempDir::new().unwrap();
    let ok = script(&dir, "ok.txt", "print(1)\n");

    for raw in ["inf", "-2", "1e300"] {
        labrunner()
            .arg("run")
            .arg(&ok)
            .args(["--timeout", raw])
            .assert()
            .failure()
            .stderr(predicate::str::contains("--timeout"));
    }
}

#[test]
fn test_run_same_file_twice_runs_once() {
    let dir = TempDir::new().unwrap();
    let hello = script(&dir, "hello.txt", "print('hello')\n");

    labrunner()
        .arg("run")
        .arg(&hello)
        .arg(&hello)
        .assert()
        .success()
        .stdout(predicate::str::contains("hello"))
        .stderr(predicate::str::contains("1 of 1 scripts ok"));
}
