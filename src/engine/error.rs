//! Orchestrator error type.

use thiserror::Error;

use crate::download::PoolClosed;
use crate::queue::QueueError;

/// Errors that abort an orchestrator call.
///
/// Page and item failures never show up here: they are recorded on the
/// queue item instead.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Queue operation failed.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Settings out of range.
    #[error("invalid engine settings: {0}")]
    InvalidSettings(String),

    /// The worker pool stopped accepting work.
    #[error("worker pool closed unexpectedly")]
    WorkerPoolClosed(#[from] PoolClosed),

    /// The shared HTTP client could not be created.
    #[error("failed to create HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Preparing a working directory failed.
    #[error("failed to prepare directory {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    /// Returns true when the error is about one item (unknown id, illegal
    /// state change) rather than the engine itself.
    #[must_use]
    pub fn is_item_error(&self) -> bool {
        matches!(
            self,
            Self::Queue(
                QueueError::ItemNotFound(_)
                    | QueueError::InvalidTransition { .. }
                    | QueueError::PageOutOfRange { .. }
            )
        )
    }
}
