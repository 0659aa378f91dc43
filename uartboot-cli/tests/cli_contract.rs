//! Integration tests for core CLI contract behavior.

use {predicates::prelude::*, std::fs, tempfile::tempdir};

/// A port path that cannot exist on any platform the tests run on.
const MISSING_PORT: &str = "/nonexistent/uartboot-tty";

fn cli_cmd() -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("uartboot");
    cmd.env_remove("UARTBOOT_PORT")
        .env_remove("UARTBOOT_BAUD")
        .env_remove("UARTBOOT_ADDRESS")
        .env_remove("UARTBOOT_NON_INTERACTIVE")
        .env("NO_COLOR", "1");
    cmd
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    cli_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("uartboot"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    cli_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("uartboot"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn subcommand_help_lists_options() {
    cli_cmd()
        .args(["flash", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--address"))
        .stdout(predicate::str::contains("--verify"));
}

#[test]
fn missing_subcommand_is_usage_error() {
    cli_cmd().assert().code(2);
}

#[test]
fn unknown_subcommand_is_usage_error() {
    cli_cmd()
        .arg("definitely-not-a-command")
        .assert()
        .code(2)
        .stdout(predicate::str::is_empty());
}

#[test]
fn unsupported_baud_is_usage_error() {
    cli_cmd()
        .args(["--baud", "921600", "info"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unsupported baud rate"));
}

#[test]
fn malformed_address_is_usage_error() {
    cli_cmd()
        .args(["read", "--address", "0xZZ"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Invalid number"));
}

#[test]
fn missing_firmware_file_fails_before_opening_port() {
    let dir = tempdir().expect("tempdir should be created");
    let missing = dir.path().join("not_exists.bin");

    cli_cmd()
        .current_dir(dir.path())
        .args(["--non-interactive", "--port", MISSING_PORT, "flash", "--yes"])
        .arg(missing.as_os_str())
        .assert()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Cannot read firmware file"));
}

#[test]
fn empty_firmware_file_is_rejected() {
    let dir = tempdir().expect("tempdir should be created");
    let empty = dir.path().join("empty.bin");
    fs::write(&empty, b"").expect("write empty.bin");

    cli_cmd()
        .current_dir(dir.path())
        .args(["--non-interactive", "--port", MISSING_PORT, "flash", "--yes"])
        .arg(empty.as_os_str())
        .assert()
        .code(2)
        .stderr(predicate::str::contains("no firmware data"));
}

#[test]
fn oversized_read_is_rejected_without_a_device() {
    let dir = tempdir().expect("tempdir should be created");
    cli_cmd()
        .current_dir(dir.path())
        .args(["--port", MISSING_PORT, "read", "--size", "300"])
        .assert()
        .code(2)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("read size must be 1..=256"));
}

#[test]
fn zero_size_erase_is_rejected() {
    let dir = tempdir().expect("tempdir should be created");
    cli_cmd()
        .current_dir(dir.path())
        .args(["--port", MISSING_PORT, "erase", "--size", "0", "--yes"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("size must not be zero"));
}

#[test]
fn non_interactive_erase_requires_yes() {
    let dir = tempdir().expect("tempdir should be created");
    cli_cmd()
        .current_dir(dir.path())
        .env("UARTBOOT_NON_INTERACTIVE", "true")
        .args(["--port", MISSING_PORT, "erase"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("--yes"));
}

#[test]
fn unopenable_port_is_operation_failure() {
    let dir = tempdir().expect("tempdir should be created");
    cli_cmd()
        .current_dir(dir.path())
        .args(["--non-interactive", "--port", MISSING_PORT, "info", "--json"])
        .assert()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Error"));
}

#[test]
fn list_ports_json_returns_envelope() {
    let output = cli_cmd()
        .args(["list-ports", "--json"])
        .output()
        .expect("command should execute");
    assert!(output.status.success());

    let parsed: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout should be JSON");
    assert_eq!(parsed["ok"], true);
    assert!(parsed["data"]["ports"].is_array());
}

#[test]
fn completions_bash_writes_script() {
    cli_cmd()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("uartboot"));
}

#[test]
fn port_from_environment_is_used() {
    let dir = tempdir().expect("tempdir should be created");
    cli_cmd()
        .current_dir(dir.path())
        .env("UARTBOOT_PORT", MISSING_PORT)
        .args(["--non-interactive", "jump"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("uartboot-tty"));
}
