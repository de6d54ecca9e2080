//! Integration tests that lock the diagnostic binary's output.

use std::env;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

fn config_dir(suffix: &str, settings: Option<&str>) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time should be after epoch")
        .as_nanos();
    let dir = env::temp_dir().join(format!("cmdline-hook-bin-{suffix}-{nanos}"));
    fs::create_dir_all(&dir).expect("create config dir");
    if let Some(contents) = settings {
        fs::write(dir.join("settings.toml"), contents).expect("write settings");
    }
    dir
}

fn run(dir: &PathBuf, args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_cmdline-hook"))
        .args(args)
        .env("CMDLINE_HOOK_CONFIG_DIR", dir)
        .output()
        .expect("run cmdline-hook")
}

#[test]
fn print_config_shows_effective_settings() {
    let dir = config_dir("print", Some("terminate_autoanswer = 1\nctrld_exits = true\n"));
    let output = run(&dir, &["--print-config"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("terminate_autoanswer = 1"));
    assert!(stdout.contains("ctrld_exits = true"));
    assert!(stdout.contains("logging = false"));
    let _ = fs::remove_dir_all(dir);
}

#[test]
fn print_config_defaults_without_settings_file() {
    let dir = config_dir("defaults", None);
    let output = run(&dir, &["--print-config"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("terminate_autoanswer = 0"));
    assert!(stdout.contains("ctrld_exits = false"));
    let _ = fs::remove_dir_all(dir);
}

#[test]
fn print_config_fails_on_invalid_settings() {
    let dir = config_dir("invalid", Some("ctrld_exits = \"maybe\"\n"));
    let output = run(&dir, &["--print-config"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("invalid settings"));
    let _ = fs::remove_dir_all(dir);
}

#[test]
fn doctor_reports_interactivity_of_command_line() {
    let dir = config_dir("doctor", None);
    let output = run(&dir, &["--doctor", "--command-line", "cmd.exe /c dir"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("cmdline-hook doctor"));
    assert!(stdout.contains("  interactive: no"));
    assert!(stdout.contains("  validation: ok"));
    let _ = fs::remove_dir_all(dir);
}

#[test]
fn doctor_is_the_default_action() {
    let dir = config_dir("default-action", None);
    let output = run(&dir, &[]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("  interactive: yes"));
    let _ = fs::remove_dir_all(dir);
}
