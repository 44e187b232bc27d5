//! Run-wide engine settings and the per-run summary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use super::error::EngineError;
use crate::assemble::{ArtifactFormat, SplitPolicy};
use crate::download::{MAX_PAGE_BYTES, MIN_PAGE_BYTES};
use crate::progress::DEFAULT_PROGRESS_INTERVAL;
use crate::queue::{FailureMode, ItemId};

/// Minimum allowed concurrency / worker count.
pub const MIN_CONCURRENCY: usize = 1;

/// Maximum allowed concurrency / worker count.
pub const MAX_CONCURRENCY: usize = 64;

/// Default global in-flight page limit.
pub const DEFAULT_GLOBAL_MAX_CONCURRENT: usize = 8;

/// Default number of fetch workers.
pub const DEFAULT_WORKER_COUNT: usize = 8;

/// Default base request deadline, before the library multiplier.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Settings shared by every item in a run.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Where assembled artifacts go.
    pub output_dir: PathBuf,
    /// Root of the page staging area (`<work_dir>/pages/<item_id>/`).
    pub work_dir: PathBuf,
    pub global_max_concurrent: usize,
    pub worker_count: usize,
    /// Base per-request deadline.
    pub request_timeout: Duration,
    pub failure_mode: FailureMode,
    /// Global split thresholds; a library may override the byte limit.
    pub split: SplitPolicy,
    pub artifact_format: ArtifactFormat,
    pub progress_interval: Duration,
    pub min_page_bytes: u64,
    /// Responses longer than this are abandoned as integrity failures.
    pub max_page_bytes: u64,
}

impl EngineSettings {
    /// Default settings writing artifacts to `output_dir` and staging pages
    /// under `work_dir`.
    #[must_use]
    pub fn new(output_dir: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            work_dir: work_dir.into(),
            global_max_concurrent: DEFAULT_GLOBAL_MAX_CONCURRENT,
            worker_count: DEFAULT_WORKER_COUNT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            failure_mode: FailureMode::default(),
            split: SplitPolicy::default(),
            artifact_format: ArtifactFormat::default(),
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            min_page_bytes: MIN_PAGE_BYTES,
            max_page_bytes: MAX_PAGE_BYTES,
        }
    }

    /// Checks every bounded value.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidSettings`] naming the first bad value.
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&self.global_max_concurrent) {
            return Err(EngineError::InvalidSettings(format!(
                "global_max_concurrent {} must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}",
                self.global_max_concurrent
            )));
        }
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&self.worker_count) {
            return Err(EngineError::InvalidSettings(format!(
                "worker_count {} must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}",
                self.worker_count
            )));
        }
        if self.request_timeout.is_zero() {
            return Err(EngineError::InvalidSettings(
                "request_timeout must be greater than zero".to_string(),
            ));
        }
        if self.max_page_bytes < self.min_page_bytes.max(1) {
            return Err(EngineError::InvalidSettings(format!(
                "max_page_bytes {} must be at least min_page_bytes ({})",
                self.max_page_bytes, self.min_page_bytes
            )));
        }
        Ok(())
    }

    /// Staging directory of one item.
    #[must_use]
    pub fn staging_dir(&self, item_id: ItemId) -> PathBuf {
        staging_dir(&self.work_dir, item_id)
    }
}

/// `<work_dir>/pages/<item_id>`.
#[must_use]
pub fn staging_dir(work_dir: &Path, item_id: ItemId) -> PathBuf {
    work_dir.join("pages").join(item_id.to_string())
}

/// What one [`super::Orchestrator::run_until_idle`] call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub items_completed: usize,
    pub items_failed: usize,
    pub pages_validated: usize,
    pub bytes_downloaded: u64,
    /// Fetch attempts that finished (cancelled ones excluded).
    pub attempts: usize,
    pub retries_scheduled: usize,
    pub elapsed: Duration,
}
