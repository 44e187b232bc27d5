//! Orchestration of resolution, page fetching and assembly.
//!
//! The [`Orchestrator`] is the command surface (`submit`, `pause`, `resume`,
//! `cancel`, `retry`, `remove`, `list_all`) and runs the coordination loop. The loop is the only
//! code that turns worker reports into queue mutations:
//!
//! 1. `Pending` items are resolved on background tasks.
//! 2. The [`Scheduler`] picks eligible pages under the global and
//!    per-library limits; the pages are marked `Fetching` and handed to the
//!    [`WorkerPool`].
//! 3. Each [`WorkerEvent`] is written back to the [`QueueStore`].
//! 4. [`QueueItem::download_phase`] decides whether an item keeps
//!    downloading, waits out a backoff, fails or moves on to assembly.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use manuscript_core::engine::{EngineSettings, Orchestrator};
//! use manuscript_core::library::PolicyTable;
//! use manuscript_core::queue::QueueStore;
//! use manuscript_core::resolver::{JsonManifestResolver, ResolverRegistry};
//! use manuscript_core::Database;
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = QueueStore::sqlite(Database::new(Path::new("queue.db")).await?).await?;
//! let mut resolvers = ResolverRegistry::new();
//! resolvers.register(Box::new(JsonManifestResolver::new()?));
//!
//! let settings = EngineSettings::new("out", ".state");
//! let engine = Arc::new(Orchestrator::open(settings, store, resolvers, PolicyTable::default()).await?);
//! engine.submit("https://library.example/ms/42/manifest.json").await?;
//! let summary = engine.run_until_idle().await?;
//! println!("completed {} item(s)", summary.items_completed);
//! # Ok(())
//! # }
//! ```

mod error;
mod scheduler;
mod settings;

pub use error::EngineError;
pub use scheduler::{Dispatch, DispatchPermit, Scheduler};
pub use settings::{
    DEFAULT_GLOBAL_MAX_CONCURRENT, DEFAULT_REQUEST_TIMEOUT, DEFAULT_WORKER_COUNT, EngineSettings,
    MAX_CONCURRENCY, MIN_CONCURRENCY, RunSummary, staging_dir,
};

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{Mutex, Notify, broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::assemble::{Assembler, AssemblyError, SplitPolicy};
use crate::download::{
    CONNECT_TIMEOUT, FetchOutcome, FetchTask, PageClient, PageValidator, WorkerEvent, WorkerPool,
};
use crate::failure::ErrorKind;
use crate::library::PolicyTable;
use crate::progress::{ProgressAggregator, ProgressEvent, ProgressHandle, ProgressUpdate};
use crate::queue::{
    AttemptOutcome, DownloadPhase, ItemFailure, ItemId, ItemState, NewPageAttempt,
    PageAttempt, PageRange, PageStatus, QueueError, QueueItem, QueueStats, QueueStore, now_millis,
};
use crate::resolver::{ResolveError, ResolvedManifest, ResolverRegistry};

/// Longest the loop sleeps without a timer or event.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

/// Completion of a background resolve or assembly task.
#[derive(Debug)]
enum TaskResult {
    Resolved {
        item_id: ItemId,
        result: Result<ResolvedManifest, ResolveError>,
    },
    Assembled {
        item_id: ItemId,
        result: Result<Vec<PathBuf>, AssemblyError>,
    },
}

/// Per-run bookkeeping of the coordination loop.
struct RunState {
    scheduler: Scheduler,
    tasks: mpsc::UnboundedSender<TaskResult>,
    resolving: HashSet<ItemId>,
    assembling: HashSet<ItemId>,
    in_flight: usize,
    summary: RunSummary,
}

impl RunState {
    fn outstanding(&self) -> usize {
        self.in_flight + self.resolving.len() + self.assembling.len()
    }
}

/// Drives queue items from submission to a terminal state.
///
/// Commands take `&self`, so an `Arc<Orchestrator>` can accept `cancel` or
/// `submit` from other tasks while [`Self::run_until_idle`] is running.
pub struct Orchestrator {
    settings: EngineSettings,
    store: QueueStore,
    resolvers: Arc<ResolverRegistry>,
    policies: Arc<PolicyTable>,
    client: PageClient,
    validator: PageValidator,
    assembler: Assembler,
    progress: ProgressHandle,
    cancellations: DashMap<ItemId, CancellationToken>,
    wake: Notify,
    running: Mutex<()>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("settings", &self.settings)
            .field("resolvers", &self.resolvers)
            .field("active_tokens", &self.cancellations.len())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator over an opened queue store.
    ///
    /// Must be called inside a Tokio runtime (the progress aggregator task is
    /// spawned here).
    ///
    /// # Errors
    ///
    /// - [`EngineError::InvalidSettings`] for out-of-range settings
    /// - [`EngineError::Io`] if the staging directory cannot be created
    /// - [`EngineError::HttpClient`] if the page client cannot be built
    #[instrument(skip_all, fields(output_dir = %settings.output_dir.display()))]
    pub async fn open(
        settings: EngineSettings,
        store: QueueStore,
        resolvers: ResolverRegistry,
        policies: PolicyTable,
    ) -> Result<Self, EngineError> {
        settings.validate()?;
        tokio::fs::create_dir_all(&settings.work_dir)
            .await
            .map_err(|source| EngineError::Io {
                path: settings.work_dir.clone(),
                source,
            })?;

        let client = PageClient::with_connect_timeout(CONNECT_TIMEOUT.min(settings.request_timeout))?
            .with_max_body_bytes(settings.max_page_bytes);
        let validator = PageValidator::new(settings.min_page_bytes);
        let assembler = Assembler::new(settings.output_dir.clone(), settings.artifact_format);
        let progress = ProgressAggregator::spawn(settings.progress_interval);

        info!(
            global_max = settings.global_max_concurrent,
            workers = settings.worker_count,
            resolvers = resolvers.resolver_count(),
            libraries = policies.libraries().len(),
            "orchestrator ready"
        );

        Ok(Self {
            settings,
            store,
            resolvers: Arc::new(resolvers),
            policies: Arc::new(policies),
            client,
            validator,
            assembler,
            progress,
            cancellations: DashMap::new(),
            wake: Notify::new(),
            running: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    #[must_use]
    pub fn store(&self) -> &QueueStore {
        &self.store
    }

    /// Enqueues a manuscript URL and returns its item id.
    ///
    /// Submitting a URL that is already queued and not finished returns the
    /// existing item.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Queue`] if the insert fails.
    pub async fn submit(&self, url: &str) -> Result<ItemId, EngineError> {
        self.submit_with(url, None).await
    }

    /// Enqueues only `pages` of a manuscript; `None` takes every page.
    ///
    /// The range is applied once the manifest is resolved. A range starting
    /// after the last page fails the item with a resolution error.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Queue`] if the insert fails.
    #[instrument(skip(self), fields(url = %url))]
    pub async fn submit_with(
        &self,
        url: &str,
        pages: Option<PageRange>,
    ) -> Result<ItemId, EngineError> {
        let enqueued = self.store.enqueue_with(url, pages).await?;
        if enqueued.created {
            if let Some(item) = self.store.get(enqueued.id).await {
                self.report_state(&item);
            }
            self.wake.notify_one();
        }
        Ok(enqueued.id)
    }

    /// Cancels an item, aborting its in-flight fetches.
    ///
    /// Validated pages stay on disk; nothing is assembled.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Queue`] for unknown ids or terminal items.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: ItemId) -> Result<QueueItem, EngineError> {
        let item = self.store.cancel(id).await?;
        self.abort_fetches(id);
        self.report_state(&item);
        self.wake.notify_one();
        info!(item_id = id, validated = item.validated_pages(), "item cancelled");
        Ok(item)
    }

    /// Holds an item, aborting its in-flight fetches.
    ///
    /// Validated pages are kept. The item is skipped by scheduling until
    /// [`Self::resume`] and does not keep [`Self::run_until_idle`] running.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Queue`] for unknown ids or items that cannot be
    /// paused (assembling or terminal).
    #[instrument(skip(self))]
    pub async fn pause(&self, id: ItemId) -> Result<QueueItem, EngineError> {
        let item = self.store.pause(id).await?;
        self.abort_fetches(id);
        self.report_state(&item);
        self.wake.notify_one();
        info!(item_id = id, validated = item.validated_pages(), "item paused");
        Ok(item)
    }

    /// Releases a paused item.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Queue`] for unknown ids or items that are not
    /// paused.
    #[instrument(skip(self))]
    pub async fn resume(&self, id: ItemId) -> Result<QueueItem, EngineError> {
        let item = self.store.resume(id).await?;
        self.report_state(&item);
        self.wake.notify_one();
        Ok(item)
    }

    /// Pauses every item that can be paused.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Queue`] if a save fails.
    pub async fn pause_all(&self) -> Result<Vec<ItemId>, EngineError> {
        let paused = self.store.pause_all().await?;
        for id in &paused {
            self.abort_fetches(*id);
            if let Some(item) = self.store.get(*id).await {
                self.report_state(&item);
            }
        }
        self.wake.notify_one();
        info!(items = paused.len(), "queue paused");
        Ok(paused)
    }

    /// Resumes every paused item.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Queue`] if a save fails.
    pub async fn resume_all(&self) -> Result<Vec<ItemId>, EngineError> {
        let resumed = self.store.resume_all().await?;
        for id in &resumed {
            if let Some(item) = self.store.get(*id).await {
                self.report_state(&item);
            }
        }
        self.wake.notify_one();
        info!(items = resumed.len(), "queue resumed");
        Ok(resumed)
    }

    /// Reopens a `Failed` or `Cancelled` item.
    ///
    /// Validated pages are kept; only the missing pages are fetched again.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Queue`] for unknown ids or items in any other
    /// state.
    #[instrument(skip(self))]
    pub async fn retry(&self, id: ItemId) -> Result<QueueItem, EngineError> {
        let item = self.store.reopen(id).await?;
        self.report_state(&item);
        self.wake.notify_one();
        Ok(item)
    }

    /// Removes an item, cancelling it first when still active.
    ///
    /// Files on disk are left alone.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Queue`] for unknown ids.
    #[instrument(skip(self))]
    pub async fn remove(&self, id: ItemId) -> Result<QueueItem, EngineError> {
        if let Some(item) = self.store.get(id).await
            && !item.state.is_terminal()
        {
            match self.store.cancel(id).await {
                Ok(_) | Err(QueueError::InvalidTransition { .. }) => {}
                Err(error) => return Err(error.into()),
            }
        }
        self.abort_fetches(id);
        let removed = self.store.remove(id).await?;
        self.wake.notify_one();
        Ok(removed)
    }

    /// Every item in submission order.
    pub async fn list_all(&self) -> Vec<QueueItem> {
        self.store.list().await
    }

    pub async fn get(&self, id: ItemId) -> Option<QueueItem> {
        self.store.get(id).await
    }

    /// Item counts per state.
    pub async fn stats(&self) -> QueueStats {
        self.store.stats().await
    }

    /// Removes every `Completed` item.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Queue`] if a delete fails.
    pub async fn clear_completed(&self) -> Result<Vec<ItemId>, EngineError> {
        Ok(self.store.clear_completed().await?)
    }

    /// Removes every `Failed` or `Cancelled` item.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Queue`] if a delete fails.
    pub async fn clear_failed(&self) -> Result<Vec<ItemId>, EngineError> {
        Ok(self.store.clear_failed().await?)
    }

    /// Drops every cached manifest. Returns the number of entries removed.
    pub async fn clear_manifest_cache(&self) -> u64 {
        self.resolvers.clear_cache().await
    }

    /// Attempt history of one item, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Queue`] if the query fails.
    pub async fn attempts_for(&self, id: ItemId) -> Result<Vec<PageAttempt>, EngineError> {
        Ok(self.store.attempts_for(id).await?)
    }

    /// Subscribes to progress updates.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.progress.subscribe()
    }

    /// Flushes pending progress updates and stops the aggregator.
    pub async fn shutdown(self) {
        for entry in &self.cancellations {
            entry.value().cancel();
        }
        self.progress.shutdown().await;
    }

    /// Processes the queue until no item is left in a non-terminal state.
    ///
    /// Only one run is active at a time; a second call waits for the first.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] only for engine-level failures (database,
    /// worker pool). Item failures are recorded on the items.
    #[instrument(skip(self))]
    pub async fn run_until_idle(&self) -> Result<RunSummary, EngineError> {
        let _running = self.running.lock().await;
        let started = Instant::now();

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (tasks_tx, mut tasks) = mpsc::unbounded_channel();
        let pool = WorkerPool::spawn(
            self.settings.worker_count,
            self.settings.global_max_concurrent,
            self.client.clone(),
            self.validator.clone(),
            events_tx,
        );
        let mut run = RunState {
            scheduler: Scheduler::new(
                self.settings.global_max_concurrent,
                Arc::clone(&self.policies),
            ),
            tasks: tasks_tx,
            resolving: HashSet::new(),
            assembling: HashSet::new(),
            in_flight: 0,
            summary: RunSummary::default(),
        };

        info!("run started");
        let result = self.drive(&mut run, &pool, &mut events, &mut tasks).await;
        if result.is_err() {
            for entry in &self.cancellations {
                entry.value().cancel();
            }
            self.cancellations.clear();
        }
        drop(events);
        pool.shutdown().await;

        result?;
        run.summary.elapsed = started.elapsed();
        info!(
            completed = run.summary.items_completed,
            failed = run.summary.items_failed,
            pages = run.summary.pages_validated,
            retries = run.summary.retries_scheduled,
            elapsed_ms = run.summary.elapsed.as_millis(),
            "run finished"
        );
        Ok(run.summary)
    }

    async fn drive(
        &self,
        run: &mut RunState,
        pool: &WorkerPool,
        events: &mut mpsc::UnboundedReceiver<WorkerEvent>,
        tasks: &mut mpsc::UnboundedReceiver<TaskResult>,
    ) -> Result<(), EngineError> {
        let mut stalled = false;
        loop {
            let next_retry = self.advance(run, pool).await?;

            if run.outstanding() == 0 && next_retry.is_none() {
                if !self.store.has_active().await {
                    return Ok(());
                }
                if stalled {
                    warn!("active items cannot make progress, ending run");
                    return Ok(());
                }
                stalled = true;
                continue;
            }
            stalled = false;

            let wait = next_retry.unwrap_or(IDLE_WAIT);
            tokio::select! {
                Some(event) = events.recv() => {
                    run.in_flight = run.in_flight.saturating_sub(1);
                    self.on_worker_event(run, event).await?;
                }
                Some(result) = tasks.recv() => {
                    self.on_task_result(run, result).await?;
                }
                () = tokio::time::sleep(wait) => {
                    debug!("backoff timer elapsed");
                }
                () = self.wake.notified() => {
                    debug!("woken by command");
                }
            }
        }
    }

    /// One scheduling pass; returns the time until the next backoff expires.
    async fn advance(
        &self,
        run: &mut RunState,
        pool: &WorkerPool,
    ) -> Result<Option<Duration>, EngineError> {
        for item in self.store.list().await {
            match item.state {
                ItemState::Pending => self.start_resolving(run, item.id).await?,
                ItemState::Resolving if !run.resolving.contains(&item.id) => {
                    self.spawn_resolve(run, &item);
                }
                ItemState::Assembling if !run.assembling.contains(&item.id) => {
                    self.spawn_assembly(run, item);
                }
                ItemState::Downloading | ItemState::RetryWait => {
                    self.settle_download(run, &item).await?;
                }
                _ => {}
            }
        }

        let items = self.store.list().await;
        let now = now_millis();
        for dispatch in run.scheduler.select(&items, now) {
            self.dispatch(run, pool, &items, dispatch).await?;
        }
        Ok(next_retry_delay(&items, now))
    }

    async fn start_resolving(&self, run: &mut RunState, id: ItemId) -> Result<(), EngineError> {
        if let Some(item) = tolerate(self.store.begin_resolving(id).await)? {
            self.report_state(&item);
            self.spawn_resolve(run, &item);
        }
        Ok(())
    }

    fn spawn_resolve(&self, run: &mut RunState, item: &QueueItem) {
        run.resolving.insert(item.id);
        let item_id = item.id;
        let url = item.source_url.clone();
        let resolvers = Arc::clone(&self.resolvers);
        let tasks = run.tasks.clone();
        debug!(item_id, url = %url, "resolving manifest");

        tokio::spawn(async move {
            let lookup_url = url.clone();
            let joined = tokio::spawn(async move { resolvers.resolve(&lookup_url).await }).await;
            let result = joined.unwrap_or_else(|error| {
                Err(ResolveError::resolution_failed(
                    &url,
                    &format!("resolver task failed: {error}"),
                ))
            });
            let _ = tasks.send(TaskResult::Resolved { item_id, result });
        });
    }

    fn spawn_assembly(&self, run: &mut RunState, item: QueueItem) {
        run.assembling.insert(item.id);
        let split = self.split_for(&item);
        let assembler = self.assembler.clone();
        let tasks = run.tasks.clone();
        debug!(item_id = item.id, ?split, "assembling item");

        tokio::spawn(async move {
            let item_id = item.id;
            let result = assembler.assemble(item, split).await;
            let _ = tasks.send(TaskResult::Assembled { item_id, result });
        });
    }

    /// Applies the download phase of a `Downloading`/`RetryWait` item.
    async fn settle_download(&self, run: &mut RunState, item: &QueueItem) -> Result<(), EngineError> {
        match item.download_phase(self.settings.failure_mode) {
            DownloadPhase::Downloading if item.state == ItemState::RetryWait => {
                self.transition(item.id, ItemState::Downloading).await?;
            }
            DownloadPhase::RetryWait if item.state == ItemState::Downloading => {
                self.transition(item.id, ItemState::RetryWait).await?;
            }
            DownloadPhase::ReadyToAssemble => {
                if item.state == ItemState::RetryWait {
                    self.transition(item.id, ItemState::Downloading).await?;
                }
                if let Some(item) = self.transition(item.id, ItemState::Assembling).await? {
                    self.spawn_assembly(run, item);
                }
            }
            DownloadPhase::Failed { pages } => {
                let failure = page_failure(item, pages);
                self.fail_item(run, item.id, failure).await?;
            }
            DownloadPhase::Downloading | DownloadPhase::RetryWait => {}
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        run: &mut RunState,
        pool: &WorkerPool,
        items: &[QueueItem],
        dispatch: Dispatch,
    ) -> Result<(), EngineError> {
        let Dispatch {
            item_id,
            page_index,
            library,
            permit,
        } = dispatch;

        let attempt = match self.store.mark_page_fetching(item_id, page_index).await {
            Ok(attempt) => attempt,
            Err(error @ QueueError::InvalidValue { .. }) => {
                debug!(item_id, page_index, error = %error, "page no longer eligible");
                return Ok(());
            }
            Err(error) => {
                tolerate::<u32>(Err(error))?;
                return Ok(());
            }
        };

        let Some(page) = items
            .iter()
            .find(|item| item.id == item_id)
            .and_then(|item| item.pages.get(page_index))
        else {
            tolerate(self.store.release_page(item_id, page_index).await)?;
            return Ok(());
        };

        let policy = self.policies.get(&library);
        let task = FetchTask {
            item_id,
            page_index,
            url: page.url.clone(),
            expected: page.expected,
            attempt,
            staging_dir: self.settings.staging_dir(item_id),
            timeout: policy.request_timeout(self.settings.request_timeout),
            retry: policy.retry_policy(),
            cancel: self.cancel_token(item_id),
            permit,
        };
        pool.submit(task).await?;
        run.in_flight += 1;

        debug!(item_id, page_index, attempt, library = %library, "page handed to worker");
        self.progress.report(ProgressEvent::PageStarted {
            item_id,
            page_index,
        });
        Ok(())
    }

    async fn on_worker_event(&self, run: &mut RunState, event: WorkerEvent) -> Result<(), EngineError> {
        let (item_id, page_index) = (event.item_id, event.page_index);
        let reported = self.apply_worker_event(run, event).await;
        if !matches!(reported, Ok(true)) {
            self.progress.report(ProgressEvent::PageReleased { item_id, page_index });
        }
        reported.map(|_| ())
    }

    /// Records one finished attempt. Returns true when a page progress
    /// event closing the attempt was reported.
    async fn apply_worker_event(&self, run: &mut RunState, event: WorkerEvent) -> Result<bool, EngineError> {
        let Some(item) = self.store.get(event.item_id).await else {
            debug!(item_id = event.item_id, "report for removed item dropped");
            return Ok(false);
        };
        self.record_history(&event).await;

        let WorkerEvent {
            item_id,
            page_index,
            attempt,
            outcome,
            ..
        } = event;
        let page = item.pages.get(page_index);
        let is_current =
            page.is_some_and(|page| page.status == PageStatus::Fetching && page.attempt == attempt);

        match outcome {
            FetchOutcome::Validated {
                local_path,
                byte_size,
                sha256,
                ..
            } => {
                run.summary.attempts += 1;
                if page.is_some_and(|page| page.status == PageStatus::Validated) {
                    debug!(item_id, page_index, attempt, "page already validated");
                    return Ok(false);
                }
                if tolerate(
                    self.store
                        .record_page_validated(item_id, page_index, local_path, byte_size, sha256)
                        .await,
                )?
                .is_none()
                {
                    return Ok(false);
                }
                run.summary.pages_validated += 1;
                run.summary.bytes_downloaded += byte_size;
                self.progress.report(ProgressEvent::PageValidated {
                    item_id,
                    page_index,
                    bytes: byte_size,
                });
                Ok(true)
            }
            FetchOutcome::RetryScheduled {
                delay, kind, error, ..
            } => {
                run.summary.attempts += 1;
                if !is_current {
                    return Ok(false);
                }
                let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
                let retry_at = now_millis().saturating_add(delay_ms);
                if tolerate(
                    self.store
                        .record_page_retry(item_id, page_index, retry_at, kind, &error)
                        .await,
                )? != Some(true)
                {
                    return Ok(false);
                }
                run.summary.retries_scheduled += 1;
                self.progress.report(ProgressEvent::PageFailed {
                    item_id,
                    page_index,
                    kind,
                    terminal: false,
                });
                Ok(true)
            }
            FetchOutcome::Exhausted { kind, error, .. } => {
                run.summary.attempts += 1;
                if !is_current {
                    return Ok(false);
                }
                if tolerate(
                    self.store
                        .record_page_failed(item_id, page_index, kind, &error)
                        .await,
                )? != Some(true)
                {
                    return Ok(false);
                }
                self.progress.report(ProgressEvent::PageFailed {
                    item_id,
                    page_index,
                    kind,
                    terminal: true,
                });
                Ok(true)
            }
            FetchOutcome::Cancelled => {
                if is_current {
                    tolerate(self.store.release_page(item_id, page_index).await)?;
                }
                Ok(false)
            }
        }
    }

    async fn on_task_result(&self, run: &mut RunState, result: TaskResult) -> Result<(), EngineError> {
        match result {
            TaskResult::Resolved { item_id, result } => {
                run.resolving.remove(&item_id);
                self.on_resolved(run, item_id, result).await
            }
            TaskResult::Assembled { item_id, result } => {
                run.assembling.remove(&item_id);
                self.on_assembled(run, item_id, result).await
            }
        }
    }

    async fn on_resolved(
        &self,
        run: &mut RunState,
        item_id: ItemId,
        result: Result<ResolvedManifest, ResolveError>,
    ) -> Result<(), EngineError> {
        let Some(item) = self
            .store
            .get(item_id)
            .await
            .filter(|item| item.state == ItemState::Resolving)
        else {
            debug!(item_id, "resolution finished for an item that moved on");
            return Ok(());
        };

        let manifest = match result {
            Ok(manifest) => manifest,
            Err(error) => {
                let failure = ItemFailure {
                    kind: error.kind(),
                    message: first_line(&error.to_string()),
                    pages: Vec::new(),
                };
                return self.fail_item(run, item_id, failure).await;
            }
        };

        let mut pages = manifest.page_refs();
        if let Some(range) = item.page_range {
            match range.select(pages.len()) {
                Ok(selected) => {
                    debug!(item_id, %range, total = pages.len(), "applying page range");
                    pages.truncate(selected.end);
                    pages.drain(..selected.start);
                }
                Err(reason) => {
                    let failure = ItemFailure {
                        kind: ErrorKind::Resolution,
                        message: first_line(
                            &ResolveError::resolution_failed(&item.source_url, &reason).to_string(),
                        ),
                        pages: Vec::new(),
                    };
                    return self.fail_item(run, item_id, failure).await;
                }
            }
        }

        let stored = self
            .store
            .set_manifest(item_id, manifest.display_name(), manifest.library(), pages)
            .await;
        match stored {
            Ok(item) => {
                info!(
                    item_id,
                    pages = item.total_pages(),
                    library = %item.library_key(),
                    "manifest stored"
                );
                self.report_state(&item);
                Ok(())
            }
            Err(QueueError::InvalidValue { .. }) => {
                let failure = ItemFailure {
                    kind: ErrorKind::Resolution,
                    message: first_line(&ResolveError::empty_manifest(&item.source_url).to_string()),
                    pages: Vec::new(),
                };
                self.fail_item(run, item_id, failure).await
            }
            Err(error) => tolerate::<QueueItem>(Err(error)).map(|_| ()),
        }
    }

    async fn on_assembled(
        &self,
        run: &mut RunState,
        item_id: ItemId,
        result: Result<Vec<PathBuf>, AssemblyError>,
    ) -> Result<(), EngineError> {
        match result {
            Ok(outputs) => match tolerate(self.store.complete(item_id, outputs).await)? {
                Some(item) => {
                    run.summary.items_completed += 1;
                    self.cancellations.remove(&item_id);
                    info!(item_id, parts = item.outputs.len(), "item completed");
                    self.report_state(&item);
                }
                None => warn!(item_id, "item changed state during assembly, artifacts kept"),
            },
            Err(error) => {
                let pages = match &error {
                    AssemblyError::PageNotReady { index } => vec![*index],
                    _ => Vec::new(),
                };
                let failure = ItemFailure {
                    kind: error.kind(),
                    message: first_line(&error.to_string()),
                    pages,
                };
                self.fail_item(run, item_id, failure).await?;
            }
        }
        Ok(())
    }

    async fn fail_item(
        &self,
        run: &mut RunState,
        item_id: ItemId,
        failure: ItemFailure,
    ) -> Result<(), EngineError> {
        let kind = failure.kind;
        if let Some(item) = tolerate(self.store.fail(item_id, failure).await)? {
            self.abort_fetches(item_id);
            run.summary.items_failed += 1;
            warn!(
                item_id,
                kind = %kind,
                error = item.last_error.as_deref().unwrap_or_default(),
                "item failed"
            );
            self.report_state(&item);
        }
        Ok(())
    }

    async fn transition(
        &self,
        id: ItemId,
        next: ItemState,
    ) -> Result<Option<QueueItem>, EngineError> {
        let item = tolerate(self.store.update_state(id, next).await)?;
        if let Some(item) = &item {
            self.report_state(item);
        }
        Ok(item)
    }

    async fn record_history(&self, event: &WorkerEvent) {
        let (outcome, error_kind, http_status, byte_size, message) = match &event.outcome {
            FetchOutcome::Validated { byte_size, .. } => {
                (AttemptOutcome::Validated, None, None, Some(*byte_size), None)
            }
            FetchOutcome::RetryScheduled {
                kind,
                error,
                http_status,
                ..
            } => (
                AttemptOutcome::Retried,
                Some(*kind),
                *http_status,
                None,
                Some(error.as_str()),
            ),
            FetchOutcome::Exhausted {
                kind,
                error,
                http_status,
            } => (
                AttemptOutcome::Failed,
                Some(*kind),
                *http_status,
                None,
                Some(error.as_str()),
            ),
            FetchOutcome::Cancelled => (
                AttemptOutcome::Cancelled,
                Some(ErrorKind::Cancellation),
                None,
                None,
                None,
            ),
        };

        let attempt = NewPageAttempt {
            item_id: event.item_id,
            page_index: event.page_index,
            attempt: event.attempt,
            outcome,
            error_kind,
            http_status,
            byte_size,
            duration_ms: u64::try_from(event.duration.as_millis()).unwrap_or(u64::MAX),
            message,
        };
        if let Err(error) = self.store.record_attempt(&attempt).await {
            warn!(item_id = event.item_id, error = %error, "failed to record attempt history");
        }
    }

    fn report_state(&self, item: &QueueItem) {
        self.progress.report(ProgressEvent::ItemState {
            item_id: item.id,
            state: item.state,
            downloaded_pages: item.validated_pages(),
            total_pages: item.total_pages(),
            downloaded_bytes: item.validated_bytes(),
        });
    }

    fn split_for(&self, item: &QueueItem) -> SplitPolicy {
        let policy = self.policies.get(&item.library_key());
        self.settings.split.override_bytes(policy.split_max_bytes)
    }

    fn cancel_token(&self, id: ItemId) -> CancellationToken {
        self.cancellations.entry(id).or_default().clone()
    }

    fn abort_fetches(&self, id: ItemId) {
        if let Some((_, token)) = self.cancellations.remove(&id) {
            token.cancel();
        }
    }
}

/// Swallows errors about a single item that changed under us (removed,
/// cancelled, already terminal); everything else propagates.
fn tolerate<T>(result: Result<T, QueueError>) -> Result<Option<T>, EngineError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(
            error @ (QueueError::ItemNotFound(_)
            | QueueError::InvalidTransition { .. }
            | QueueError::PageOutOfRange { .. }),
        ) => {
            debug!(error = %error, "stale item update skipped");
            Ok(None)
        }
        Err(error) => Err(error.into()),
    }
}

/// Cause recorded when pages ran out of attempts.
fn page_failure(item: &QueueItem, pages: Vec<usize>) -> ItemFailure {
    let first = pages.first().and_then(|index| item.pages.get(*index));
    let kind = first
        .and_then(|page| page.error_kind)
        .unwrap_or(ErrorKind::Network);

    let message = match first {
        Some(page) => {
            let detail = page.last_error.as_deref().unwrap_or("no attempts left");
            if pages.len() == 1 {
                format!(
                    "page {} failed after {} attempt(s): {detail}",
                    page.index, page.attempt
                )
            } else {
                format!(
                    "{} pages failed, first page {} after {} attempt(s): {detail}",
                    pages.len(),
                    page.index,
                    page.attempt
                )
            }
        }
        None => "item has no pages to download".to_string(),
    };

    ItemFailure {
        kind,
        message,
        pages,
    }
}

/// Time until the earliest future backoff among downloading items.
fn next_retry_delay(items: &[QueueItem], now: i64) -> Option<Duration> {
    items
        .iter()
        .filter(|item| matches!(item.state, ItemState::Downloading | ItemState::RetryWait))
        .filter_map(QueueItem::next_retry_at)
        .filter(|at| *at > now)
        .min()
        .map(|at| Duration::from_millis(u64::try_from(at - now).unwrap_or(0)))
}

fn first_line(message: &str) -> String {
    message.lines().next().unwrap_or_default().to_string()
}
