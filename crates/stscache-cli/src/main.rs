//! stscache - reuse MFA-derived short-lived credentials across shell
//! invocations.
//!
//! Credentials go to stdout; logs and prompts go to stderr/tty so the output
//! can be used directly as an AWS `credential_process` or `eval`ed.

mod cli;
mod commands;
mod config;
mod output;

use std::io;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::Cli;

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

fn main() -> Result<ExitCode> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    init_tracing();
    debug!(?cli, "stscache starting");

    commands::run(cli)
}
