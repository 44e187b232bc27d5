//! Durable queue of manuscript items.
//!
//! [`QueueStore`] owns the authoritative in-memory map of [`QueueItem`]s and
//! is the only place item or page state changes. Every mutation runs under a
//! single async mutex: it is applied to a copy, written through
//! [`QueuePersistence`] and only then committed to memory, so the in-memory
//! view never runs ahead of disk.
//!
//! # Example
//!
//! ```no_run
//! use manuscript_core::queue::QueueStore;
//! use manuscript_core::Database;
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new(Path::new("queue.db")).await?;
//! let store = QueueStore::sqlite(db).await?;
//!
//! let enqueued = store.enqueue("https://library.example/manifest/42").await?;
//! let item = store.get(enqueued.id).await;
//! # Ok(())
//! # }
//! ```

mod error;
mod history;
mod item;
mod persistence;

pub use error::{QueueDbErrorKind, QueueError};
pub use history::{AttemptOutcome, NewPageAttempt, PageAttempt};
pub use item::{
    DownloadPhase, ExpectedKind, FailureMode, ItemFailure, ItemId, ItemState, PageRange, PageRef,
    PageStatus, QueueItem,
};
pub use persistence::{QueuePersistence, SaveScope, SqlitePersistence};

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::db::Database;
use crate::failure::ErrorKind;

/// Pause before the single retry of a save that hit a busy database.
const BUSY_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Returns `Ok(())` if at least one row was affected; otherwise [`QueueError::ItemNotFound`].
fn check_affected(id: i64, rows_affected: u64) -> Result<()> {
    if rows_affected == 0 {
        Err(QueueError::ItemNotFound(id))
    } else {
        Ok(())
    }
}

/// Current wall-clock time in unix milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
}

/// Normalizes a submitted URL for duplicate detection.
///
/// Trims whitespace, drops the fragment and any trailing slash. Scheme and
/// host case are normalized when the URL parses.
#[must_use]
pub fn canonicalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let normalized = match Url::parse(trimmed) {
        Ok(mut url) => {
            url.set_fragment(None);
            url.to_string()
        }
        Err(_) => trimmed
            .split('#')
            .next()
            .unwrap_or_default()
            .to_string(),
    };
    normalized.trim_end_matches('/').to_string()
}

/// Result of [`QueueStore::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enqueued {
    /// The new item, or the active item already holding this URL.
    pub id: ItemId,
    /// False when an existing item was returned.
    pub created: bool,
}

/// Item counts per state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    /// Count for every [`ItemState`], in lifecycle order.
    pub by_state: Vec<(ItemState, usize)>,
    /// Pages across all items.
    pub total_pages: usize,
    /// Validated pages across all items.
    pub validated_pages: usize,
}

impl QueueStats {
    /// Number of items in `state`.
    #[must_use]
    pub fn count(&self, state: ItemState) -> usize {
        self.by_state
            .iter()
            .find(|(candidate, _)| *candidate == state)
            .map_or(0, |(_, count)| *count)
    }

    /// Total number of items.
    #[must_use]
    pub fn total(&self) -> usize {
        self.by_state.iter().map(|(_, count)| count).sum()
    }
}

/// Single-writer queue of manuscript items.
#[derive(Clone)]
pub struct QueueStore {
    items: Arc<Mutex<BTreeMap<ItemId, QueueItem>>>,
    persistence: Arc<dyn QueuePersistence>,
}

impl fmt::Debug for QueueStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueStore").finish_non_exhaustive()
    }
}

impl QueueStore {
    /// Opens a store backed by `SQLite`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if loading or repairing the snapshot fails.
    pub async fn sqlite(db: Database) -> Result<Self> {
        Self::open(Arc::new(SqlitePersistence::new(db))).await
    }

    /// Loads every persisted item and repairs state left by an interrupted run.
    ///
    /// - `Resolving` items go back to `Pending`.
    /// - Pages left `Fetching` go back to `Queued`; the interrupted attempt is
    ///   not counted.
    /// - `Validated` pages whose file is missing or has the wrong size go back
    ///   to `Queued`; an `Assembling` item with such a page returns to
    ///   `Downloading`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if loading or saving a repaired item fails.
    #[instrument(skip(persistence))]
    pub async fn open(persistence: Arc<dyn QueuePersistence>) -> Result<Self> {
        let loaded = persistence.load_all().await?;
        let mut items = BTreeMap::new();
        let mut repaired = 0_usize;

        for mut item in loaded {
            if recover_item(&mut item).await {
                item.updated_at = now_millis();
                persistence.save(&item, SaveScope::Full).await?;
                repaired += 1;
            }
            items.insert(item.id, item);
        }

        info!(items = items.len(), repaired, "queue loaded");

        Ok(Self {
            items: Arc::new(Mutex::new(items)),
            persistence,
        })
    }

    /// Adds a `Pending` item for every page of `source_url`.
    ///
    /// An active (non-terminal) item with the same canonical URL is returned
    /// instead of creating a duplicate.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the insert fails.
    pub async fn enqueue(&self, source_url: &str) -> Result<Enqueued> {
        self.enqueue_with(source_url, None).await
    }

    /// Adds a `Pending` item limited to `page_range` of the manifest.
    ///
    /// Duplicates are matched on canonical URL and page range together.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the insert fails.
    #[instrument(skip(self), fields(url = %source_url))]
    pub async fn enqueue_with(
        &self,
        source_url: &str,
        page_range: Option<PageRange>,
    ) -> Result<Enqueued> {
        let canonical_url = canonicalize_url(source_url);
        let mut items = self.items.lock().await;

        if let Some(existing) = items.values().find(|item| {
            !item.state.is_terminal()
                && item.canonical_url == canonical_url
                && item.page_range == page_range
        }) {
            debug!(item_id = existing.id, "duplicate submission");
            return Ok(Enqueued {
                id: existing.id,
                created: false,
            });
        }

        let now = now_millis();
        let mut item = QueueItem {
            id: 0,
            source_url: source_url.trim().to_string(),
            canonical_url,
            library: None,
            display_name: None,
            state: ItemState::Pending,
            page_range,
            pages: Vec::new(),
            retry_count: 0,
            last_error: None,
            failure: None,
            outputs: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        item.id = self.persistence.insert_item(&item).await?;
        let id = item.id;
        items.insert(id, item);

        info!(item_id = id, "item enqueued");
        Ok(Enqueued { id, created: true })
    }

    /// Returns a snapshot of one item.
    pub async fn get(&self, id: ItemId) -> Option<QueueItem> {
        self.items.lock().await.get(&id).cloned()
    }

    /// Returns a snapshot of every item in id (submission) order.
    pub async fn list(&self) -> Vec<QueueItem> {
        self.items.lock().await.values().cloned().collect()
    }

    /// Returns true while any item still has work to do.
    ///
    /// Terminal and `Paused` items do not count.
    pub async fn has_active(&self) -> bool {
        self.items
            .lock()
            .await
            .values()
            .any(|item| !item.state.is_terminal() && item.state != ItemState::Paused)
    }

    /// Counts items per state.
    pub async fn stats(&self) -> QueueStats {
        let items = self.items.lock().await;
        let by_state = ItemState::ALL
            .into_iter()
            .map(|state| {
                let count = items.values().filter(|item| item.state == state).count();
                (state, count)
            })
            .collect();
        QueueStats {
            by_state,
            total_pages: items.values().map(QueueItem::total_pages).sum(),
            validated_pages: items.values().map(QueueItem::validated_pages).sum(),
        }
    }

    /// Moves an item to `next`, enforcing the lifecycle.
    ///
    /// `Completed` additionally requires every page to be validated.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidTransition`] for an illegal move and
    /// [`QueueError::ItemNotFound`] for an unknown id.
    #[instrument(skip(self), fields(to = %next))]
    pub async fn update_state(&self, id: ItemId, next: ItemState) -> Result<QueueItem> {
        self.mutate(id, SaveScope::Item, |item| {
            transition(item, next)?;
            Ok(item.clone())
        })
        .await
    }

    /// `Pending → Resolving`.
    ///
    /// # Errors
    ///
    /// See [`Self::update_state`].
    pub async fn begin_resolving(&self, id: ItemId) -> Result<QueueItem> {
        self.update_state(id, ItemState::Resolving).await
    }

    /// Stores the resolved manifest and moves `Resolving → Downloading`.
    ///
    /// Pages are re-indexed by position; `display_name` and `library` only
    /// overwrite existing values when present.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidValue`] for an empty page list and
    /// [`QueueError::InvalidTransition`] unless the item is `Resolving`.
    #[instrument(skip(self, pages), fields(pages = pages.len()))]
    pub async fn set_manifest(
        &self,
        id: ItemId,
        display_name: Option<String>,
        library: Option<String>,
        mut pages: Vec<PageRef>,
    ) -> Result<QueueItem> {
        if pages.is_empty() {
            return Err(QueueError::invalid_value("pages", "empty manifest"));
        }
        for (position, page) in pages.iter_mut().enumerate() {
            page.index = position;
        }

        self.mutate(id, SaveScope::Full, move |item| {
            if item.state != ItemState::Resolving {
                return Err(QueueError::invalid_transition(
                    id,
                    item.state,
                    ItemState::Downloading,
                ));
            }
            if display_name.is_some() {
                item.display_name = display_name;
            }
            if library.is_some() {
                item.library = library;
            }
            item.pages = pages;
            item.state = ItemState::Downloading;
            Ok(item.clone())
        })
        .await
    }

    /// Claims a page for a fetch attempt and returns the attempt number.
    ///
    /// Moves a `RetryWait` item back to `Downloading`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidTransition`] unless the item is
    /// downloading, and [`QueueError::InvalidValue`] if the page is not
    /// eligible for dispatch.
    #[instrument(skip(self))]
    pub async fn mark_page_fetching(&self, id: ItemId, index: usize) -> Result<u32> {
        let now = now_millis();
        self.mutate(id, SaveScope::Page(index), |item| {
            match item.state {
                ItemState::Downloading => {}
                ItemState::RetryWait => item.state = ItemState::Downloading,
                other => {
                    return Err(QueueError::invalid_transition(
                        id,
                        other,
                        ItemState::Downloading,
                    ));
                }
            }
            let page = page_mut(item, index)?;
            if !page.is_eligible(now) {
                return Err(QueueError::invalid_value(
                    "page_status",
                    page.status.as_str(),
                ));
            }
            page.status = PageStatus::Fetching;
            page.attempt += 1;
            page.retry_at = None;
            Ok(page.attempt)
        })
        .await
    }

    /// Marks a page stored and verified.
    ///
    /// Applied in every state so a cancelled item keeps what was already
    /// fetched for a later resume.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if the item or page does not exist or the write fails.
    #[instrument(skip(self, local_path, sha256))]
    pub async fn record_page_validated(
        &self,
        id: ItemId,
        index: usize,
        local_path: PathBuf,
        byte_size: u64,
        sha256: String,
    ) -> Result<()> {
        self.mutate(id, SaveScope::Page(index), move |item| {
            let page = page_mut(item, index)?;
            page.status = PageStatus::Validated;
            page.local_path = Some(local_path);
            page.byte_size = Some(byte_size);
            page.sha256 = Some(sha256);
            page.retry_at = None;
            page.error_kind = None;
            page.last_error = None;
            Ok(())
        })
        .await
    }

    /// Marks a page failed but retryable after `retry_at` (unix millis).
    ///
    /// Returns false (and changes nothing) when the item is already terminal.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if the item or page does not exist or the write fails.
    #[instrument(skip(self, message), fields(kind = %kind))]
    pub async fn record_page_retry(
        &self,
        id: ItemId,
        index: usize,
        retry_at: i64,
        kind: ErrorKind,
        message: &str,
    ) -> Result<bool> {
        self.mutate(id, SaveScope::Page(index), |item| {
            if item.state.is_terminal() {
                return Ok(false);
            }
            item.retry_count += 1;
            item.last_error = Some(message.to_string());
            let page = page_mut(item, index)?;
            page.status = PageStatus::Failed;
            page.retry_at = Some(retry_at);
            page.error_kind = Some(kind);
            page.last_error = Some(message.to_string());
            Ok(true)
        })
        .await
    }

    /// Marks a page terminally failed.
    ///
    /// Returns false (and changes nothing) when the item is already terminal.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if the item or page does not exist or the write fails.
    #[instrument(skip(self, message), fields(kind = %kind))]
    pub async fn record_page_failed(
        &self,
        id: ItemId,
        index: usize,
        kind: ErrorKind,
        message: &str,
    ) -> Result<bool> {
        self.mutate(id, SaveScope::Page(index), |item| {
            if item.state.is_terminal() {
                return Ok(false);
            }
            item.last_error = Some(message.to_string());
            let page = page_mut(item, index)?;
            page.status = PageStatus::Failed;
            page.retry_at = None;
            page.error_kind = Some(kind);
            page.last_error = Some(message.to_string());
            Ok(true)
        })
        .await
    }

    /// Returns a `Fetching` page to `Queued` without counting the attempt.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if the item or page does not exist or the write fails.
    #[instrument(skip(self))]
    pub async fn release_page(&self, id: ItemId, index: usize) -> Result<()> {
        self.mutate(id, SaveScope::Page(index), |item| {
            let page = page_mut(item, index)?;
            if page.status == PageStatus::Fetching {
                page.status = PageStatus::Queued;
                page.attempt = page.attempt.saturating_sub(1);
            }
            Ok(())
        })
        .await
    }

    /// `Assembling → Completed`, recording the written artifacts.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidTransition`] unless the item is
    /// `Assembling` with every page validated.
    #[instrument(skip(self, outputs), fields(parts = outputs.len()))]
    pub async fn complete(&self, id: ItemId, outputs: Vec<PathBuf>) -> Result<QueueItem> {
        self.mutate(id, SaveScope::Item, move |item| {
            transition(item, ItemState::Completed)?;
            item.outputs = outputs;
            item.failure = None;
            item.last_error = None;
            Ok(item.clone())
        })
        .await
    }

    /// Moves a non-terminal item to `Failed`, recording the cause.
    ///
    /// Pages still marked `Fetching` return to `Queued`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidTransition`] if the item is already terminal.
    #[instrument(skip(self, failure), fields(kind = %failure.kind))]
    pub async fn fail(&self, id: ItemId, failure: ItemFailure) -> Result<QueueItem> {
        self.mutate(id, SaveScope::Full, move |item| {
            transition(item, ItemState::Failed)?;
            requeue_in_flight(item);
            item.last_error = Some(failure.to_string());
            item.failure = Some(failure);
            Ok(item.clone())
        })
        .await
    }

    /// Moves a non-terminal item to `Cancelled`.
    ///
    /// Validated pages are kept; pages still marked `Fetching` return to
    /// `Queued`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidTransition`] if the item is already terminal.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: ItemId) -> Result<QueueItem> {
        self.mutate(id, SaveScope::Full, |item| {
            transition(item, ItemState::Cancelled)?;
            requeue_in_flight(item);
            Ok(item.clone())
        })
        .await
    }

    /// Holds an item until [`Self::resume`].
    ///
    /// Validated pages are kept; pages still marked `Fetching` return to
    /// `Queued` without counting the attempt.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidTransition`] unless the item is pending,
    /// resolving or downloading.
    #[instrument(skip(self))]
    pub async fn pause(&self, id: ItemId) -> Result<QueueItem> {
        self.mutate(id, SaveScope::Full, |item| {
            transition(item, ItemState::Paused)?;
            requeue_in_flight(item);
            info!(item_id = id, "item paused");
            Ok(item.clone())
        })
        .await
    }

    /// Releases a `Paused` item.
    ///
    /// It returns to `Pending` without a manifest, to `Assembling` when every
    /// page is validated, and to `Downloading` otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidTransition`] unless the item is `Paused`.
    #[instrument(skip(self))]
    pub async fn resume(&self, id: ItemId) -> Result<QueueItem> {
        self.mutate(id, SaveScope::Item, |item| {
            let next = item.resume_state();
            if item.state != ItemState::Paused {
                return Err(QueueError::invalid_transition(id, item.state, next));
            }
            transition(item, next)?;
            info!(item_id = id, state = %next, "item resumed");
            Ok(item.clone())
        })
        .await
    }

    /// Pauses every pausable item, returning their ids.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if a save fails; earlier pauses stay applied.
    pub async fn pause_all(&self) -> Result<Vec<ItemId>> {
        let targets = self.ids_where(ItemState::is_pausable).await;
        for id in &targets {
            self.pause(*id).await?;
        }
        Ok(targets)
    }

    /// Resumes every `Paused` item, returning their ids.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if a save fails; earlier resumes stay applied.
    pub async fn resume_all(&self) -> Result<Vec<ItemId>> {
        let targets = self
            .ids_where(|state| state == ItemState::Paused)
            .await;
        for id in &targets {
            self.resume(*id).await?;
        }
        Ok(targets)
    }

    /// Reopens a `Failed` or `Cancelled` item.
    ///
    /// - no manifest: back to `Pending`;
    /// - every page validated: straight to `Assembling`;
    /// - otherwise failed pages get a fresh attempt budget and the item
    ///   returns to `Downloading`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidTransition`] for any other state.
    #[instrument(skip(self))]
    pub async fn reopen(&self, id: ItemId) -> Result<QueueItem> {
        self.mutate(id, SaveScope::Full, |item| {
            if !matches!(item.state, ItemState::Failed | ItemState::Cancelled) {
                return Err(QueueError::invalid_transition(
                    id,
                    item.state,
                    ItemState::Pending,
                ));
            }

            item.failure = None;
            item.last_error = None;
            for page in &mut item.pages {
                if matches!(page.status, PageStatus::Failed | PageStatus::Fetching) {
                    page.reset_to_queued();
                    page.attempt = 0;
                    page.error_kind = None;
                    page.last_error = None;
                }
            }

            item.state = item.resume_state();
            info!(item_id = id, state = %item.state, "item reopened");
            Ok(item.clone())
        })
        .await
    }

    /// Deletes an item and its history. Files on disk are left alone.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ItemNotFound`] for an unknown id.
    #[instrument(skip(self))]
    pub async fn remove(&self, id: ItemId) -> Result<QueueItem> {
        let mut items = self.items.lock().await;
        if !items.contains_key(&id) {
            return Err(QueueError::ItemNotFound(id));
        }
        self.persistence.delete_item(id).await?;
        let removed = items.remove(&id).ok_or(QueueError::ItemNotFound(id))?;
        info!(item_id = id, "item removed");
        Ok(removed)
    }

    /// Removes every `Completed` item, returning their ids.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if a delete fails; earlier deletes stay applied.
    pub async fn clear_completed(&self) -> Result<Vec<ItemId>> {
        self.clear_where(|state| state == ItemState::Completed).await
    }

    /// Removes every `Failed` or `Cancelled` item, returning their ids.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if a delete fails; earlier deletes stay applied.
    pub async fn clear_failed(&self) -> Result<Vec<ItemId>> {
        self.clear_where(|state| matches!(state, ItemState::Failed | ItemState::Cancelled))
            .await
    }

    /// Appends an attempt history row.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the insert fails.
    pub async fn record_attempt(&self, attempt: &NewPageAttempt<'_>) -> Result<i64> {
        self.persistence.record_attempt(attempt).await
    }

    /// Returns the attempt history of an item, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the query fails.
    pub async fn attempts_for(&self, id: ItemId) -> Result<Vec<PageAttempt>> {
        self.persistence.attempts_for(id).await
    }

    async fn ids_where(&self, matches: impl Fn(ItemState) -> bool) -> Vec<ItemId> {
        self.items
            .lock()
            .await
            .values()
            .filter(|item| matches(item.state))
            .map(|item| item.id)
            .collect()
    }

    #[instrument(skip(self, matches))]
    async fn clear_where(&self, matches: impl Fn(ItemState) -> bool) -> Result<Vec<ItemId>> {
        let mut items = self.items.lock().await;
        let targets: Vec<ItemId> = items
            .values()
            .filter(|item| matches(item.state))
            .map(|item| item.id)
            .collect();

        for id in &targets {
            self.persistence.delete_item(*id).await?;
            items.remove(id);
        }

        info!(removed = targets.len(), "cleared items");
        Ok(targets)
    }

    async fn mutate<T>(
        &self,
        id: ItemId,
        scope: SaveScope,
        apply: impl FnOnce(&mut QueueItem) -> Result<T>,
    ) -> Result<T> {
        let mut items = self.items.lock().await;
        let current = items.get(&id).ok_or(QueueError::ItemNotFound(id))?;

        let mut updated = current.clone();
        let value = apply(&mut updated)?;
        if updated == *current {
            return Ok(value);
        }

        updated.updated_at = now_millis();
        if let Err(error) = self.persistence.save(&updated, scope).await {
            if !error.is_busy_or_locked() {
                return Err(error);
            }
            warn!(item_id = id, error = %error, "queue database busy, retrying save once");
            tokio::time::sleep(BUSY_RETRY_DELAY).await;
            self.persistence.save(&updated, scope).await?;
        }
        if updated.state != current.state {
            debug!(item_id = id, from = %current.state, to = %updated.state, "state transition");
        }
        items.insert(id, updated);
        Ok(value)
    }
}

fn transition(item: &mut QueueItem, next: ItemState) -> Result<()> {
    let allowed = item.state.can_transition_to(next)
        && (next != ItemState::Completed || item.all_validated());
    if !allowed {
        return Err(QueueError::invalid_transition(item.id, item.state, next));
    }
    item.state = next;
    Ok(())
}

fn page_mut(item: &mut QueueItem, index: usize) -> Result<&mut PageRef> {
    let id = item.id;
    item.pages
        .get_mut(index)
        .ok_or(QueueError::PageOutOfRange { id, index })
}

fn requeue_in_flight(item: &mut QueueItem) {
    for page in &mut item.pages {
        if page.status == PageStatus::Fetching {
            page.status = PageStatus::Queued;
            page.attempt = page.attempt.saturating_sub(1);
        }
    }
}

/// Repairs one loaded item; returns true if anything changed.
async fn recover_item(item: &mut QueueItem) -> bool {
    if item.state == ItemState::Completed {
        return false;
    }

    let mut changed = false;
    if item.state == ItemState::Resolving {
        item.state = ItemState::Pending;
        changed = true;
    }

    let mut lost_pages = false;
    for page in &mut item.pages {
        match page.status {
            PageStatus::Fetching => {
                page.status = PageStatus::Queued;
                page.attempt = page.attempt.saturating_sub(1);
                changed = true;
            }
            PageStatus::Validated if !stored_file_intact(page).await => {
                warn!(
                    item_id = item.id,
                    page_index = page.index,
                    "validated page missing on disk, requeueing"
                );
                page.reset_to_queued();
                lost_pages = true;
                changed = true;
            }
            _ => {}
        }
    }

    if lost_pages && item.state == ItemState::Assembling {
        item.state = ItemState::Downloading;
    }
    changed
}

async fn stored_file_intact(page: &PageRef) -> bool {
    let (Some(path), Some(expected)) = (&page.local_path, page.byte_size) else {
        return false;
    };
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|meta| meta.is_file() && meta.len() == expected)
}
