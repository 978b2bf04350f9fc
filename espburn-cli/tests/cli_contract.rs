//! Integration tests for core CLI contract behavior.

use {predicates::prelude::*, std::fs, tempfile::tempdir};

fn cli_cmd() -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("espburn");
    cmd.env_remove("ESPBURN_PORT")
        .env_remove("ESPBURN_BAUD")
        .env_remove("ESPBURN_STUB_DIR")
        .env("ESPBURN_NON_INTERACTIVE", "true");
    cmd
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    cli_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("espburn"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    cli_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("espburn"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn help_lists_subcommands() {
    cli_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("flash")
                .and(predicate::str::contains("info"))
                .and(predicate::str::contains("list-ports"))
                .and(predicate::str::contains("completions")),
        );
}

#[test]
fn list_ports_json_returns_valid_json() {
    let output = cli_cmd()
        .args(["list-ports", "--json"])
        .output()
        .expect("command should execute");
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    let value: serde_json::Value =
        serde_json::from_str(stdout.trim()).expect("stdout should be a single JSON document");
    assert_eq!(value["ok"], true);
    assert!(value["data"]["ports"].is_array());
}

#[test]
fn completions_bash_writes_script_to_stdout() {
    cli_cmd()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("espburn"));
}

#[test]
fn completions_without_shell_is_usage_error() {
    cli_cmd()
        .arg("completions")
        .assert()
        .failure()
        .code(2)
        .stdout(predicate::str::is_empty());
}

#[test]
fn flash_without_bin_is_usage_error() {
    cli_cmd()
        .arg("flash")
        .assert()
        .failure()
        .code(2)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("--bin"));
}

#[test]
fn flash_bin_without_address_is_usage_error() {
    cli_cmd()
        .args(["flash", "--bin", "app.bin"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn flash_with_unknown_mode_is_usage_error() {
    cli_cmd()
        .args(["flash", "--bin", "app.bin:0x10000", "--flash-mode", "quad"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn unknown_command_is_usage_error() {
    cli_cmd()
        .arg("falsh")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("flash").or(predicate::str::contains("did you mean")));
}

#[test]
fn unknown_flag_suggests_similar() {
    cli_cmd()
        .args(["list-ports", "--jason"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("json"));
}

#[test]
fn flash_with_missing_file_fails() {
    let dir = tempdir().expect("tempdir should be created");
    let missing = dir.path().join("missing.bin");

    cli_cmd()
        .current_dir(dir.path())
        .arg("flash")
        .arg("--bin")
        .arg(format!("{}:0x10000", missing.display()))
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("missing.bin"));
}

#[test]
fn flash_with_invalid_port_fails() {
    let dir = tempdir().expect("tempdir should be created");
    let image = dir.path().join("app.bin");
    fs::write(&image, [0xE9, 0x01, 0x02, 0x20]).expect("write dummy image");

    let output = cli_cmd()
        .current_dir(dir.path())
        .args(["-p", "INVALID_PORT_NAME_XYZ", "flash", "--no-stub", "--bin"])
        .arg(format!("{}:0x0", image.display()))
        .output()
        .expect("command should execute");
    assert!(!output.status.success(), "an unopenable port should not succeed");
    assert!(output.stdout.is_empty());
}

#[test]
fn invalid_local_config_is_a_warning() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(dir.path().join("espburn.toml"), "invalid toml [[[").expect("write invalid config");

    let output = cli_cmd()
        .current_dir(dir.path())
        .arg("list-ports")
        .output()
        .expect("command should execute");
    assert!(output.status.success(), "command should succeed despite config warning");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Failed to parse config file"));
}

#[test]
fn explicit_config_path_is_loaded() {
    let dir = tempdir().expect("tempdir should be created");
    let config = dir.path().join("custom.toml");
    fs::write(&config, "[flash]\nbaud = 460800\ncompress = false\n").expect("write config");

    cli_cmd()
        .arg("--config")
        .arg(&config)
        .args(["list-ports", "--json"])
        .assert()
        .success();
}

#[test]
fn colors_disabled_when_not_tty() {
    let output = cli_cmd()
        .arg("completions")
        .output()
        .expect("command should execute");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stderr.contains("\x1b["), "stderr should carry no ANSI escapes");
}
