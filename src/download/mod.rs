//! Page fetching: HTTP client, integrity validation, retry policy and the
//! worker pool that runs single fetch attempts.
//!
//! # Overview
//!
//! - [`PageClient`] - one GET with a deadline and cancellation
//! - [`PageValidator`] - size, content-type and magic-byte checks
//! - [`RetryPolicy`] / [`BackoffPolicy`] - pure retry decisions
//! - [`WorkerPool`] - fixed set of tasks executing [`FetchTask`]s
//!
//! # Example
//!
//! ```no_run
//! use manuscript_core::download::{PageClient, PageValidator};
//! use manuscript_core::queue::ExpectedKind;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = PageClient::new()?;
//! let page = client
//!     .fetch("https://library.example/f1r.jpg", Duration::from_secs(30), &CancellationToken::new())
//!     .await?;
//! let kind = PageValidator::default().validate(&page.body, page.content_type.as_deref(), ExpectedKind::Image)?;
//! println!("stored as .{}", kind.extension());
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
mod retry;
mod validate;
mod worker;

pub use client::{CONNECT_TIMEOUT, FetchedPage, PageClient};
pub use error::{FetchError, is_retryable_status};
pub use retry::{
    BackoffPolicy, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, DEFAULT_RETRY_LIMIT, MAX_JITTER_FRACTION,
    MAX_RETRY_AFTER, RetryDecision, RetryPolicy, parse_retry_after, random_jitter,
};
pub use validate::{
    MAX_PAGE_BYTES, MIN_PAGE_BYTES, PageValidator, PayloadKind, ValidationFailure, sniff};
pub use worker::{FetchOutcome, FetchTask, PoolClosed, WorkerEvent, WorkerPool};

// Note: we do NOT define module-local Result aliases here.
// Use `Result<T, FetchError>` explicitly in function signatures.
