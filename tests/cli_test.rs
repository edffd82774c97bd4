//! Binary smoke tests.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn binary_help() {
    Command::cargo_bin("mcp-gateway")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("streamable HTTP"));
}

#[test]
fn binary_version() {
    Command::cargo_bin("mcp-gateway")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("mcp-gateway"));
}

#[test]
fn binary_rejects_unknown_transport() {
    Command::cargo_bin("mcp-gateway")
        .unwrap()
        .args(["--transport", "carrier-pigeon"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid value"));
}
