// fundline-cli/tests/worker_commands.rs
// ============================================================================
// Module: Worker Command Tests
// Description: Argument parsing and the exit-code contract.
// Purpose: Pin worker behavior without reaching any external network.
// ============================================================================

//! Worker tests: clap parsing, config validation, the idle next-due path,
//! and the validation exit code for malformed source identifiers.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    reason = "Test-only assertions and helpers are permitted."
)]

use std::fs;

use clap::Parser;
use fundline_cli::Cli;
use fundline_cli::Command;
use fundline_cli::EXIT_SUCCESS;
use fundline_cli::EXIT_VALIDATION;
use fundline_cli::run_code;
use tempfile::TempDir;

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Writes a config pointing storage into the temp directory.
fn temp_config(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("fundline.toml");
    let db = dir.path().join("fundline.db");
    fs::write(
        &path,
        format!("[storage]\npath = \"{}\"\n", db.display()),
    )
    .unwrap();
    path
}

// ============================================================================
// SECTION: Parsing
// ============================================================================

#[test]
fn parses_process_and_config_commands() {
    let cli = Cli::parse_from(["fundline", "process", "--next-due"]);
    match cli.command {
        Command::Process {
            source,
            next_due,
        } => {
            assert!(source.is_none());
            assert!(next_due);
        }
        other => panic!("unexpected command: {other:?}"),
    }

    let cli = Cli::parse_from(["fundline", "config", "validate"]);
    assert!(matches!(cli.command, Command::Config { .. }));

    assert!(
        Cli::try_parse_from(["fundline", "process", "--source", "x", "--next-due"]).is_err(),
        "--source conflicts with --next-due"
    );
}

// ============================================================================
// SECTION: Exit Codes
// ============================================================================

#[test]
fn config_validate_succeeds_on_defaults() {
    let dir = TempDir::new().unwrap();
    let cli = Cli::parse_from([
        "fundline",
        "config",
        "validate",
        "--config",
        temp_config(&dir).to_str().unwrap(),
    ]);
    assert_eq!(run_code(cli), EXIT_SUCCESS);
}

#[test]
fn invalid_config_exits_with_validation() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fundline.toml");
    fs::write(&path, "[pipeline]\nrun_timeout_ms = 0\n").unwrap();
    let cli = Cli::parse_from([
        "fundline",
        "config",
        "validate",
        "--config",
        path.to_str().unwrap(),
    ]);
    assert_eq!(run_code(cli), EXIT_VALIDATION);
}

#[test]
fn malformed_source_ids_exit_with_validation() {
    let dir = TempDir::new().unwrap();
    let cli = Cli::parse_from([
        "fundline",
        "process",
        "--source",
        "not-a-uuid",
        "--config",
        temp_config(&dir).to_str().unwrap(),
    ]);
    assert_eq!(run_code(cli), EXIT_VALIDATION);
}

#[test]
fn next_due_with_no_sources_is_idle_success() {
    let dir = TempDir::new().unwrap();
    let cli = Cli::parse_from([
        "fundline",
        "process",
        "--next-due",
        "--config",
        temp_config(&dir).to_str().unwrap(),
    ]);
    assert_eq!(run_code(cli), EXIT_SUCCESS);
}

#[test]
fn unknown_sources_fail_unrecoverably() {
    let dir = TempDir::new().unwrap();
    let cli = Cli::parse_from([
        "fundline",
        "process",
        "--source",
        "5d4cdc4f-5fc0-4d7a-9c2e-1f9a4b7c9d21",
        "--config",
        temp_config(&dir).to_str().unwrap(),
    ]);
    // The coordinator classifies the missing source as a validation failure.
    assert_eq!(run_code(cli), EXIT_VALIDATION);
}

#[test]
fn cleanup_orphans_runs_against_an_empty_store() {
    let dir = TempDir::new().unwrap();
    let cli = Cli::parse_from([
        "fundline",
        "cleanup-orphans",
        "--config",
        temp_config(&dir).to_str().unwrap(),
    ]);
    assert_eq!(run_code(cli), EXIT_SUCCESS);
}
