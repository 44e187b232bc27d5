//! CLI entry point for the manuscript downloader.

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use manuscript_core::config::load_config;
use tracing::debug;

mod app;
mod cli;
mod commands;

use app::{AppContext, terminal};
use cli::{Args, Command};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // The config file may set verbosity, so it is read before tracing starts.
    let loaded = load_config(args.config.as_deref());
    let config_verbosity = loaded
        .as_ref()
        .ok()
        .and_then(|loaded| loaded.config.verbosity);
    terminal::init_tracing(terminal::default_log_level(
        args.quiet,
        args.verbose,
        config_verbosity,
    ));
    let loaded = loaded.context("Failed to load configuration")?;

    debug!(?args, config = ?loaded.path, "CLI arguments parsed");
    let ctx = AppContext::new(args.state_dir.as_deref(), loaded);

    match &args.command {
        Command::Submit { urls, pages } => {
            commands::run_submit_command(&ctx, urls, *pages).await?;
        }
        Command::Run(run) => {
            let clean = commands::run_queue_command(&ctx, run, args.quiet).await?;
            if !clean {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::List => commands::run_list_command(&ctx).await?,
        Command::Pause(target) => commands::run_pause_command(&ctx, target).await?,
        Command::Resume(target) => commands::run_resume_command(&ctx, target).await?,
        Command::Cancel { id } => commands::run_cancel_command(&ctx, *id).await?,
        Command::Retry { id } => commands::run_retry_command(&ctx, *id).await?,
        Command::Remove { id } => commands::run_remove_command(&ctx, *id).await?,
        Command::Clear(clear) => commands::run_clear_command(&ctx, clear).await?,
    }
    Ok(ExitCode::SUCCESS)
}
