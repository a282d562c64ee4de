//! CLI entry point for scriptorium.

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing::{debug, info};

mod app;
mod cli;

use app::command_dispatcher;
use app::runtime::{AppContext, resolve_settings};
use cli::Cli;

/// How the process ends; mapped to the exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessExit {
    Success,
    /// Some requested pages failed.
    Partial,
    Failure,
}

impl From<ProcessExit> for ExitCode {
    fn from(exit: ProcessExit) -> Self {
        match exit {
            ProcessExit::Success => ExitCode::SUCCESS,
            ProcessExit::Failure => ExitCode::from(1),
            ProcessExit::Partial => ExitCode::from(2),
        }
    }
}

fn init_tracing(cli: &Cli) {
    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let cli = Cli::parse();
    init_tracing(&cli);
    debug!(?cli, "CLI arguments parsed");

    let settings = resolve_settings(&cli)?;
    let ctx = AppContext::open(settings).await?;
    info!(downloads_dir = %ctx.settings.downloads_dir.display(), "scriptorium ready");

    let exit = command_dispatcher::dispatch(&cli.command, &ctx, cli.quiet).await?;
    Ok(exit.into())
}
