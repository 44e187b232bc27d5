//! Manuscript Downloader Core Library
//!
//! Takes manuscript URLs from digital libraries, resolves each into an
//! ordered page list, fetches the pages with bounded per-library concurrency
//! and retry, validates every payload, and assembles the pages into one or
//! more output artifacts. Queue state survives restarts.
//!
//! # Architecture
//!
//! - [`db`] - `SQLite` connection and migrations
//! - [`queue`] - persistent queue items and page refs
//! - [`resolver`] - manifest resolvers and their registry
//! - [`library`] - per-library concurrency, timeout and retry policies
//! - [`download`] - HTTP client, backoff, payload validation, worker pool
//! - [`engine`] - scheduler and the orchestrator run loop
//! - [`progress`] - throttled progress updates
//! - [`assemble`] - auto-split planning and artifact writers
//! - [`config`] - configuration file loading
//! - [`failure`] - error taxonomy shared by every layer

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod assemble;
pub mod config;
pub mod db;
pub mod download;
pub mod engine;
pub mod failure;
pub mod library;
pub mod progress;
pub mod queue;
pub mod resolver;
mod user_agent;

// Re-export commonly used types
pub use assemble::{ArtifactFormat, Assembler, AssemblyError, SplitPolicy};
pub use config::{ConfigError, FileConfig, LoadedConfig, VerbositySetting, load_config};
pub use db::{Database, DbError};
pub use download::{BackoffPolicy, FetchError, RetryDecision, RetryPolicy};
pub use engine::{EngineError, EngineSettings, Orchestrator, RunSummary};
pub use failure::ErrorKind;
pub use library::{LibraryPolicy, PolicyTable};
pub use progress::{ProgressEvent, ProgressUpdate};
pub use queue::{
    FailureMode, ItemId, ItemState, PageRange, PageStatus, QueueError, QueueItem, QueueStore,
};
pub use resolver::{
    JsonManifestResolver, ManifestCache, ManifestPage, ManifestResolver, ResolveError,
    ResolvedManifest, ResolverRegistry, StaticResolver,
};
