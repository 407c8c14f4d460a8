//! CLI smoke tests.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

fn crucible() -> Command {
    cargo_bin_cmd!("crucible")
}

#[test]
fn test_help() {
    crucible().arg("--help").assert().success();
}

#[test]
fn test_version() {
    crucible().arg("--version").assert().success();
}

#[test]
fn test_classify_longagent() {
    crucible()
        .args(["classify", "refactor the entire codebase to async"])
        .assert()
        .success()
        .stdout(predicate::str::contains("longagent"))
        .stdout(predicate::str::contains("high"));
}

#[test]
fn test_classify_question() {
    crucible()
        .args(["classify", "what does this function do?"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ask"));
}

#[test]
fn test_checkpoints_list_empty() {
    let dir = tempfile::tempdir().unwrap();
    crucible()
        .args(["checkpoints", "list", "nope"])
        .arg("--project-dir")
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("no checkpoints"));
}
