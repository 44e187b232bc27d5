//! Queue management commands: submit, list, pause, resume, cancel, retry,
//! remove, clear.

use anyhow::{Context, Result};
use manuscript_core::queue::ItemState;
use manuscript_core::{ItemId, ManifestCache, PageRange, QueueItem};
use tracing::info;

use crate::app::AppContext;
use crate::cli::{ClearArgs, RunArgs, TargetArgs};

pub async fn run_submit_command(
    ctx: &AppContext,
    urls: &[String],
    pages: Option<PageRange>,
) -> Result<()> {
    let engine = ctx.open_orchestrator(&RunArgs::default()).await?;
    for url in urls {
        let id = engine
            .submit_with(url, pages)
            .await
            .with_context(|| format!("Failed to enqueue '{url}'"))?;
        match pages {
            Some(range) => println!("queued #{id} {url} (pages {range})"),
            None => println!("queued #{id} {url}"),
        }
    }
    info!(count = urls.len(), "urls submitted");
    engine.shutdown().await;
    Ok(())
}

pub async fn run_list_command(ctx: &AppContext) -> Result<()> {
    let store = ctx.open_store().await?;
    let items = store.list().await;
    if items.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }

    for item in &items {
        for line in render_item_rows(item) {
            println!("{line}");
        }
    }

    let stats = store.stats().await;
    let summary: Vec<String> = stats
        .by_state
        .iter()
        .filter(|(_, count)| *count > 0)
        .map(|(state, count)| format!("{count} {state}"))
        .collect();
    println!(
        "{} item(s): {}; pages {}/{}",
        stats.total(),
        summary.join(", "),
        stats.validated_pages,
        stats.total_pages
    );
    Ok(())
}

pub async fn run_pause_command(ctx: &AppContext, target: &TargetArgs) -> Result<()> {
    let engine = ctx.open_orchestrator(&RunArgs::default()).await?;
    match target.id {
        Some(id) if !target.all => {
            let item = engine
                .pause(id)
                .await
                .with_context(|| format!("Failed to pause item #{id}"))?;
            println!(
                "paused #{id} ({}/{} pages kept)",
                item.validated_pages(),
                item.total_pages()
            );
        }
        _ => {
            let paused = engine.pause_all().await.context("Failed to pause the queue")?;
            println!("paused {} item(s)", paused.len());
        }
    }
    engine.shutdown().await;
    Ok(())
}

pub async fn run_resume_command(ctx: &AppContext, target: &TargetArgs) -> Result<()> {
    let engine = ctx.open_orchestrator(&RunArgs::default()).await?;
    match target.id {
        Some(id) if !target.all => {
            let item = engine
                .resume(id)
                .await
                .with_context(|| format!("Failed to resume item #{id}"))?;
            println!("resumed #{id} as {}", item.state);
        }
        _ => {
            let resumed = engine.resume_all().await.context("Failed to resume the queue")?;
            println!("resumed {} item(s)", resumed.len());
        }
    }
    engine.shutdown().await;
    Ok(())
}

pub async fn run_cancel_command(ctx: &AppContext, id: ItemId) -> Result<()> {
    let engine = ctx.open_orchestrator(&RunArgs::default()).await?;
    let item = engine
        .cancel(id)
        .await
        .with_context(|| format!("Failed to cancel item #{id}"))?;
    println!(
        "cancelled #{id} ({}/{} pages kept)",
        item.validated_pages(),
        item.total_pages()
    );
    engine.shutdown().await;
    Ok(())
}

pub async fn run_retry_command(ctx: &AppContext, id: ItemId) -> Result<()> {
    let engine = ctx.open_orchestrator(&RunArgs::default()).await?;
    let item = engine
        .retry(id)
        .await
        .with_context(|| format!("Failed to retry item #{id}"))?;
    println!("reopened #{id} as {}", item.state);
    engine.shutdown().await;
    Ok(())
}

pub async fn run_remove_command(ctx: &AppContext, id: ItemId) -> Result<()> {
    let engine = ctx.open_orchestrator(&RunArgs::default()).await?;
    engine
        .remove(id)
        .await
        .with_context(|| format!("Failed to remove item #{id}"))?;
    println!("removed #{id}");
    engine.shutdown().await;
    Ok(())
}

pub async fn run_clear_command(ctx: &AppContext, args: &ClearArgs) -> Result<()> {
    let engine = ctx.open_orchestrator(&RunArgs::default()).await?;
    if args.completed {
        let removed = engine.clear_completed().await?;
        println!("cleared {} completed item(s)", removed.len());
    }
    if args.failed {
        let removed = engine.clear_failed().await?;
        println!("cleared {} failed or cancelled item(s)", removed.len());
    }
    if args.cache {
        // Cleared even when caching is switched off.
        let cache = ManifestCache::new(ctx.open_database().await?, None);
        let removed = cache.clear().await;
        println!("cleared {removed} cached manifest(s)");
    }
    engine.shutdown().await;
    Ok(())
}

/// One summary line per item plus indented output and error lines.
pub(crate) fn render_item_rows(item: &QueueItem) -> Vec<String> {
    let mut name = item
        .display_name
        .as_deref()
        .unwrap_or(item.source_url.as_str())
        .to_string();
    if let Some(range) = item.page_range {
        name.push_str(&format!(" [pages {range}]"));
    }
    let mut rows = vec![format!(
        "#{:<4} {:<11} {:<16} {:>5}/{:<5} {name}",
        item.id,
        item.state.as_str(),
        item.library_key(),
        item.validated_pages(),
        item.total_pages(),
    )];
    for output in &item.outputs {
        rows.push(format!("      -> {}", output.display()));
    }
    if matches!(item.state, ItemState::Failed | ItemState::Cancelled)
        && let Some(error) = &item.last_error
    {
        rows.push(format!("      error: {error}"));
    }
    rows
}
