// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Check the firmwared command-line surface and its exit codes.
// Author: Lukas Bower

use std::fs;

use assert_cmd::Command;
use tempfile::TempDir;

fn firmwared() -> Command {
    let mut cmd = Command::cargo_bin("firmwared").expect("firmwared binary");
    cmd.env("RUST_LOG", "warn");
    cmd
}

#[test]
fn help_lists_options_and_succeeds() {
    let output = firmwared().arg("--help").assert().success().get_output().clone();
    let stdout = String::from_utf8_lossy(&output.stdout);
    for flag in ["--tentative", "--dir", "--verbose", "--config"] {
        assert!(stdout.contains(flag), "missing {flag}: {stdout}");
    }
}

#[test]
fn short_help_succeeds() {
    firmwared().arg("-h").assert().success();
}

#[test]
fn unknown_option_fails() {
    firmwared().arg("--bogus").assert().failure();
}

#[test]
fn invalid_attempt_bound_fails_before_startup() {
    let output = firmwared()
        .args(["--max-attempts", "0"])
        .assert()
        .failure()
        .get_output()
        .clone();
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("max_attempts"), "{stderr}");
}

#[test]
fn unreadable_config_file_fails() {
    let dir = TempDir::new().unwrap();
    let output = firmwared()
        .arg("--config")
        .arg(dir.path().join("missing.toml"))
        .assert()
        .failure()
        .get_output()
        .clone();
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("missing.toml"), "{stderr}");
}

#[test]
fn config_file_with_unknown_key_fails() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("firmwared.toml");
    fs::write(&path, "tentative = true\nretries = 4\n").unwrap();
    firmwared().arg("-c").arg(&path).assert().failure();
}
