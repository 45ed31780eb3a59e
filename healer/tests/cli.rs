//! CLI tests for the subcommands.
//!
//! Spawns the healer binary and checks output and exit codes.

use std::process::Command;

use healer::exit_codes;
use healer::io::config::{HealerConfig, load_config};

fn healer() -> Command {
    Command::new(env!("CARGO_BIN_EXE_healer"))
}

#[test]
fn branch_name_prints_sanitized_branch() {
    let output = healer()
        .args(["branch-name", "Code Warriors", "John Doe"])
        .output()
        .expect("healer branch-name");

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert_eq!(
        String::from_utf8_lossy(&output.stdout).trim(),
        "CODE_WARRIORS_JOHN_DOE_AI_FIX"
    );
}

#[test]
fn branch_name_rejects_empty_names() {
    let status = healer()
        .args(["branch-name", "!!!", "John"])
        .status()
        .expect("healer branch-name");
    assert_eq!(status.code(), Some(exit_codes::INVALID));
}

#[test]
fn init_config_writes_defaults_and_refuses_overwrite() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("healer.toml");

    let status = healer()
        .arg("--config")
        .arg(&path)
        .arg("init-config")
        .status()
        .expect("healer init-config");
    assert_eq!(status.code(), Some(exit_codes::OK));
    assert_eq!(load_config(&path).expect("load"), HealerConfig::default());

    let status = healer()
        .arg("--config")
        .arg(&path)
        .arg("init-config")
        .status()
        .expect("healer init-config again");
    assert_eq!(status.code(), Some(exit_codes::INVALID));

    let status = healer()
        .arg("--config")
        .arg(&path)
        .args(["init-config", "--force"])
        .status()
        .expect("healer init-config --force");
    assert_eq!(status.code(), Some(exit_codes::OK));
}

#[test]
fn show_unknown_run_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let status = healer()
        .current_dir(temp.path())
        .args(["show", "run_missing"])
        .status()
        .expect("healer show");
    assert_eq!(status.code(), Some(exit_codes::INVALID));
}

#[test]
fn run_with_unreachable_repository_is_a_fatal_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = healer()
        .current_dir(temp.path())
        .arg("--config")
        .arg(temp.path().join("healer.toml"))
        .args(["run", "--repo", "/nonexistent/healer/repo", "--json"])
        .output()
        .expect("healer run");

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    let record: serde_json::Value = serde_json::from_slice(&output.stdout).expect("record json");
    assert_eq!(record["final_status"], "failed");
    assert!(
        record["fatal_error"]
            .as_str()
            .is_some_and(|err| err.contains("git clone failed"))
    );
}
