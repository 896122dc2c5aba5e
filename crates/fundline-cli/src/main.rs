// fundline-cli/src/main.rs
// ============================================================================
// Module: Fundline Binary
// Description: Entry point for the fundline batch worker.
// Purpose: Parse arguments and hand off to the CLI library.
// Dependencies: fundline-cli, clap
// ============================================================================

//! Binary wrapper around the worker commands; all behavior lives in the
//! library so the exit-code contract stays testable.

use std::process::ExitCode;

use clap::Parser;
use fundline_cli::Cli;

/// Parses arguments and runs the worker.
fn main() -> ExitCode {
    fundline_cli::run(Cli::parse())
}
