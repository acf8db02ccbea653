//! 命令行行为测试

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

fn cmd() -> Command {
    Command::cargo_bin("heli-autopilot").unwrap()
}

#[test]
fn test_print_default_config_round_trips() {
    let output = cmd().arg("--print-default-config").output().unwrap();
    assert!(output.status.success());

    let text = String::from_utf8(output.stdout).unwrap();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();

    cmd()
        .arg("--config")
        .arg(file.path())
        .arg("--check")
        .assert()
        .success()
        .stdout(predicate::str::contains("configuration OK"));
}

#[test]
fn test_invalid_config_fails() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[telemetry]\nsend_rate_hz = 0").unwrap();

    cmd()
        .arg("--config")
        .arg(file.path())
        .arg("--check")
        .assert()
        .failure()
        .stderr(predicate::str::contains("send_rate_hz"));
}

#[test]
fn test_missing_config_file_fails() {
    cmd()
        .args(["--config", "/nonexistent/heli.toml", "--check"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read"));
}

#[test]
fn test_runs_without_devices_and_shuts_down() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "[servo.serial]\npath = \"/dev/heli-missing-servo\"\n\n[imu.serial]\npath = \"/dev/heli-missing-gx3\""
    )
    .unwrap();

    cmd()
        .arg("--config")
        .arg(file.path())
        .args(["--run-for", "0.3"])
        .assert()
        .success();
}
