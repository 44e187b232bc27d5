//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

use manuscript_core::PageRange;
use manuscript_core::engine::{MAX_CONCURRENCY, MIN_CONCURRENCY};

/// Default state directory, relative to the working directory.
pub const DEFAULT_STATE_DIR: &str = ".manuscript-downloader";

/// Download multi-page manuscripts from digital libraries.
///
/// URLs are queued with `submit` and processed with `run`; the queue lives in
/// the state directory and survives restarts.
#[derive(Parser, Debug)]
#[command(name = "manuscript-downloader")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (default: $XDG_CONFIG_HOME/manuscript-downloader/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding queue.db and staged pages
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Enqueue manifest URLs
    Submit {
        /// One or more manifest URLs
        #[arg(required = true)]
        urls: Vec<String>,

        /// Only fetch these pages, 1-based and inclusive (e.g. 3-10, 5-, 7)
        #[arg(long, value_name = "RANGE")]
        pages: Option<PageRange>,
    },
    /// Process the queue until every item is finished
    Run(RunArgs),
    /// Print all queue items
    List,
    /// Hold an item without losing its downloaded pages
    Pause(TargetArgs),
    /// Continue a paused item
    Resume(TargetArgs),
    /// Cancel an item, keeping its downloaded pages
    Cancel { id: i64 },
    /// Reopen a failed or cancelled item
    Retry { id: i64 },
    /// Remove an item from the queue
    Remove { id: i64 },
    /// Remove finished items
    Clear(ClearArgs),
}

#[derive(ClapArgs, Debug, Clone, Default)]
pub struct RunArgs {
    /// Directory for assembled artifacts (default: current directory)
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Maximum pages in flight across all libraries
    #[arg(short = 'c', long, value_parser = concurrency_parser())]
    pub concurrency: Option<usize>,

    /// Number of fetch workers
    #[arg(short = 'w', long, value_parser = concurrency_parser())]
    pub workers: Option<usize>,

    /// Retries per page after the first attempt (0-20)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u32).range(0..=20))]
    pub retries: Option<u32>,
}

/// One item id, or every item with `--all`.
#[derive(ClapArgs, Debug, Clone)]
#[group(required = true, multiple = false)]
pub struct TargetArgs {
    pub id: Option<i64>,

    /// Apply to every eligible item
    #[arg(long)]
    pub all: bool,
}

#[derive(ClapArgs, Debug, Clone)]
#[group(required = true, multiple = true)]
pub struct ClearArgs {
    /// Remove completed items
    #[arg(long)]
    pub completed: bool,

    /// Remove failed and cancelled items
    #[arg(long)]
    pub failed: bool,

    /// Drop cached manifests so URLs are resolved again
    #[arg(long)]
    pub cache: bool,
}

fn concurrency_parser() -> clap::builder::RangedU64ValueParser<usize> {
    clap::builder::RangedU64ValueParser::<usize>::new()
        .range(MIN_CONCURRENCY as u64..=MAX_CONCURRENCY as u64)
}
