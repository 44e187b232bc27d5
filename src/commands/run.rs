//! `run`: process the queue until idle.

use std::io::{self, IsTerminal};
use std::sync::Arc;

use anyhow::{Context, Result};
use manuscript_core::{ItemState, RunSummary};
use tracing::{info, warn};

use crate::app::{AppContext, progress_manager, terminal};
use crate::cli::RunArgs;

/// Runs the queue; returns true when no item failed during the run.
pub async fn run_queue_command(ctx: &AppContext, args: &RunArgs, quiet: bool) -> Result<bool> {
    let engine = Arc::new(ctx.open_orchestrator(args).await?);

    let use_bars = terminal::should_use_progress_bars(
        io::stderr().is_terminal(),
        quiet,
        terminal::is_dumb_terminal(),
    );
    let (progress_handle, progress_stop) =
        progress_manager::spawn_progress_ui(use_bars, engine.subscribe());

    let outcome = tokio::select! {
        summary = engine.run_until_idle() => Some(summary.context("Download run failed")?),
        interrupted = tokio::signal::ctrl_c() => {
            interrupted.context("Failed to listen for Ctrl-C")?;
            None
        }
    };

    progress_stop.cancel();
    if let Some(handle) = progress_handle {
        let _ = handle.await;
    }

    let Some(summary) = outcome else {
        warn!("run interrupted");
        println!("Interrupted. Pages fetched so far are kept; run again to resume.");
        return Ok(false);
    };

    let failed_items: Vec<_> = engine
        .list_all()
        .await
        .into_iter()
        .filter(|item| item.state == ItemState::Failed)
        .collect();
    for item in &failed_items {
        println!(
            "#{} failed: {}",
            item.id,
            item.last_error.as_deref().unwrap_or("unknown error")
        );
    }
    println!("{}", render_summary(&summary));

    if let Ok(engine) = Arc::try_unwrap(engine) {
        engine.shutdown().await;
    }
    info!(completed = summary.items_completed, failed = summary.items_failed, "run command finished");
    Ok(summary.items_failed == 0)
}

fn render_summary(summary: &RunSummary) -> String {
    format!(
        "Completed {} item(s), failed {}; {} page(s), {} byte(s), {} attempt(s), {} retr{} in {:.1}s",
        summary.items_completed,
        summary.items_failed,
        summary.pages_validated,
        summary.bytes_downloaded,
        summary.attempts,
        summary.retries_scheduled,
        if summary.retries_scheduled == 1 { "y" } else { "ies" },
        summary.elapsed.as_secs_f64()
    )
}
