use std::fs;

use assert_cmd::Command;

fn phpx() -> Command {
    Command::cargo_bin("phpx").expect("phpx binary")
}

#[test]
fn help_shows_the_banner_and_commands() {
    let assert = phpx().arg("--help").assert().success();
    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    assert!(stdout.contains("phpx"));
    assert!(stdout.contains("// phpx"));
    assert!(stdout.contains("tool"));
    assert!(stdout.contains("cache"));
}

#[test]
fn version_is_reported() {
    let assert = phpx().arg("--version").assert().success();
    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    assert!(stdout.contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn no_arguments_is_a_usage_error() {
    let assert = phpx().assert().failure();
    let stderr = String::from_utf8_lossy(&assert.get_output().stderr).to_string();
    assert!(stderr.contains("no script given"));
}

#[test]
fn missing_script_exits_one_with_a_diagnostic() {
    let assert = phpx().arg("does-not-exist.php").assert().code(1);
    let stderr = String::from_utf8_lossy(&assert.get_output().stderr).to_string();
    assert!(stderr.contains("error: script not found: does-not-exist.php"));
}

#[test]
fn cache_dir_honors_the_cache_path_override() {
    let temp = tempfile::tempdir().expect("tempdir");
    let assert = phpx()
        .env("PHPX_CACHE_PATH", temp.path())
        .args(["cache", "dir"])
        .assert()
        .success();
    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    assert_eq!(stdout.trim(), temp.path().to_str().expect("utf8"));
}

#[test]
fn cache_clean_removes_the_requested_subtree() {
    let temp = tempfile::tempdir().expect("tempdir");
    let tools = temp.path().join("tools");
    let php = temp.path().join("php");
    fs::create_dir_all(tools.join("phpstan-phpstan-1.10.0")).expect("seed tools");
    fs::create_dir_all(&php).expect("seed php");

    phpx()
        .env("PHPX_CACHE_PATH", temp.path())
        .args(["cache", "clean", "tools"])
        .assert()
        .success();

    assert!(!tools.exists());
    assert!(php.exists());
}

#[test]
fn cache_clean_rejects_unknown_targets() {
    let temp = tempfile::tempdir().expect("tempdir");
    let assert = phpx()
        .env("PHPX_CACHE_PATH", temp.path())
        .args(["cache", "clean", "vendor"])
        .assert()
        .code(1);
    let stderr = String::from_utf8_lossy(&assert.get_output().stderr).to_string();
    assert!(stderr.contains("unknown cache target"));
}

#[test]
fn malformed_metadata_is_a_hard_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let script = temp.path().join("broken.php");
    fs::write(&script, "<?php\n// phpx\n// php = invalid\n").expect("write script");

    let assert = phpx().arg(script.to_str().expect("utf8")).assert().code(1);
    let stderr = String::from_utf8_lossy(&assert.get_output().stderr).to_string();
    assert!(stderr.contains("failed to parse metadata"));
}
