//! Durable snapshot of the queue.
//!
//! [`QueuePersistence`] is the storage seam behind [`super::QueueStore`]; the
//! store keeps the authoritative copy in memory and writes through this trait
//! after every mutation. [`SqlitePersistence`] is the production backend.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use sqlx::{FromRow, Row, Sqlite, Transaction};
use tracing::instrument;

use super::history::{NewPageAttempt, PageAttempt};
use super::item::{
    ExpectedKind, ItemFailure, ItemId, ItemState, PageRange, PageRef, PageStatus, QueueItem,
};
use super::{QueueError, Result};
use crate::db::Database;
use crate::failure::ErrorKind;

/// Which part of an item changed, so only that part is rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveScope {
    /// Item columns only.
    Item,
    /// Item columns plus one page row.
    Page(usize),
    /// Item columns and every page row (manifest replaced or reset).
    Full,
}

/// Storage contract for queue snapshots and attempt history.
#[async_trait]
pub trait QueuePersistence: Send + Sync {
    /// Inserts a new item and returns its assigned id.
    async fn insert_item(&self, item: &QueueItem) -> Result<ItemId>;

    /// Writes the given part of `item` in one transaction.
    async fn save(&self, item: &QueueItem, scope: SaveScope) -> Result<()>;

    /// Deletes an item and its pages.
    async fn delete_item(&self, id: ItemId) -> Result<()>;

    /// Loads every item with its pages, ordered by id.
    async fn load_all(&self) -> Result<Vec<QueueItem>>;

    /// Appends one attempt history row.
    async fn record_attempt(&self, attempt: &NewPageAttempt<'_>) -> Result<i64>;

    /// Returns the attempt history of an item, oldest first.
    async fn attempts_for(&self, id: ItemId) -> Result<Vec<PageAttempt>>;
}

/// `SQLite`-backed [`QueuePersistence`].
#[derive(Debug, Clone)]
pub struct SqlitePersistence {
    db: Database,
}

impl SqlitePersistence {
    /// Wraps an open database (migrations already applied).
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn write_item(tx: &mut Transaction<'_, Sqlite>, item: &QueueItem) -> Result<()> {
        let failed_pages = item
            .failure
            .as_ref()
            .map(|failure| serde_json::to_string(&failure.pages))
            .transpose()?;
        let outputs: Vec<String> = item
            .outputs
            .iter()
            .map(|path| path.to_string_lossy().into_owned())
            .collect();
        let outputs = serde_json::to_string(&outputs)?;

        let result = sqlx::query(
            r"UPDATE queue_items
              SET library = ?,
                  display_name = ?,
                  state = ?,
                  retry_count = ?,
                  last_error = ?,
                  failure_kind = ?,
                  failure_message = ?,
                  failed_pages = ?,
                  outputs = ?,
                  updated_at = ?
              WHERE id = ?",
        )
        .bind(item.library.as_deref())
        .bind(item.display_name.as_deref())
        .bind(item.state.as_str())
        .bind(i64::from(item.retry_count))
        .bind(item.last_error.as_deref())
        .bind(item.failure.as_ref().map(|failure| failure.kind.as_str()))
        .bind(item.failure.as_ref().map(|failure| failure.message.as_str()))
        .bind(failed_pages)
        .bind(outputs)
        .bind(item.updated_at)
        .bind(item.id)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::ItemNotFound(item.id));
        }
        Ok(())
    }

    async fn write_page(
        tx: &mut Transaction<'_, Sqlite>,
        item_id: ItemId,
        page: &PageRef,
    ) -> Result<()> {
        sqlx::query(
            r"INSERT OR REPLACE INTO page_refs (
                item_id, page_index, url, label, expected_kind, status, attempt,
                byte_size, local_path, sha256, retry_at, error_kind, last_error
              )
              VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(item_id)
        .bind(to_i64(page.index))
        .bind(&page.url)
        .bind(&page.label)
        .bind(page.expected.as_str())
        .bind(page.status.as_str())
        .bind(i64::from(page.attempt))
        .bind(page.byte_size.map(u64_to_i64))
        .bind(
            page.local_path
                .as_ref()
                .map(|path| path.to_string_lossy().into_owned()),
        )
        .bind(page.sha256.as_deref())
        .bind(page.retry_at)
        .bind(page.error_kind.map(ErrorKind::as_str))
        .bind(page.last_error.as_deref())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl QueuePersistence for SqlitePersistence {
    #[instrument(skip(self, item), fields(url = %item.source_url))]
    async fn insert_item(&self, item: &QueueItem) -> Result<ItemId> {
        let row = sqlx::query(
            r"INSERT INTO queue_items (
                source_url, canonical_url, library, display_name, state,
                page_start, page_end, retry_count, created_at, updated_at
              )
              VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
              RETURNING id",
        )
        .bind(&item.source_url)
        .bind(&item.canonical_url)
        .bind(item.library.as_deref())
        .bind(item.display_name.as_deref())
        .bind(item.state.as_str())
        .bind(item.page_range.map(|range| to_i64(range.start)))
        .bind(item.page_range.and_then(|range| range.end).map(to_i64))
        .bind(i64::from(item.retry_count))
        .bind(item.created_at)
        .bind(item.updated_at)
        .fetch_one(self.db.pool())
        .await?;

        Ok(row.get("id"))
    }

    #[instrument(skip(self, item), fields(item_id = item.id))]
    async fn save(&self, item: &QueueItem, scope: SaveScope) -> Result<()> {
        let mut tx = self.db.pool().begin().await?;
        Self::write_item(&mut tx, item).await?;

        match scope {
            SaveScope::Item => {}
            SaveScope::Page(index) => {
                let page = item.pages.get(index).ok_or(QueueError::PageOutOfRange {
                    id: item.id,
                    index,
                })?;
                Self::write_page(&mut tx, item.id, page).await?;
            }
            SaveScope::Full => {
                sqlx::query("DELETE FROM page_refs WHERE item_id = ?")
                    .bind(item.id)
                    .execute(&mut *tx)
                    .await?;
                for page in &item.pages {
                    Self::write_page(&mut tx, item.id, page).await?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_item(&self, id: ItemId) -> Result<()> {
        let mut tx = self.db.pool().begin().await?;
        sqlx::query("DELETE FROM page_attempts WHERE item_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM queue_items WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        super::check_affected(id, result.rows_affected())?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn load_all(&self) -> Result<Vec<QueueItem>> {
        let item_rows = sqlx::query_as::<_, ItemRow>("SELECT * FROM queue_items ORDER BY id ASC")
            .fetch_all(self.db.pool())
            .await?;
        let page_rows = sqlx::query_as::<_, PageRow>(
            "SELECT * FROM page_refs ORDER BY item_id ASC, page_index ASC",
        )
        .fetch_all(self.db.pool())
        .await?;

        let mut pages_by_item: HashMap<ItemId, Vec<PageRef>> = HashMap::new();
        for row in page_rows {
            let item_id = row.item_id;
            pages_by_item
                .entry(item_id)
                .or_default()
                .push(row.into_page()?);
        }

        item_rows
            .into_iter()
            .map(|row| {
                let pages = pages_by_item.remove(&row.id).unwrap_or_default();
                row.into_item(pages)
            })
            .collect()
    }

    #[instrument(skip(self, attempt), fields(item_id = attempt.item_id, page_index = attempt.page_index, outcome = %attempt.outcome))]
    async fn record_attempt(&self, attempt: &NewPageAttempt<'_>) -> Result<i64> {
        let row = sqlx::query(
            r"INSERT INTO page_attempts (
                item_id, page_index, attempt, outcome, error_kind, http_status,
                byte_size, duration_ms, message, created_at
              )
              VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
              RETURNING id",
        )
        .bind(attempt.item_id)
        .bind(to_i64(attempt.page_index))
        .bind(i64::from(attempt.attempt))
        .bind(attempt.outcome.as_str())
        .bind(attempt.error_kind.map(ErrorKind::as_str))
        .bind(attempt.http_status.map(i64::from))
        .bind(attempt.byte_size.map(u64_to_i64))
        .bind(u64_to_i64(attempt.duration_ms))
        .bind(attempt.message)
        .bind(super::now_millis())
        .fetch_one(self.db.pool())
        .await?;

        Ok(row.get("id"))
    }

    #[instrument(skip(self))]
    async fn attempts_for(&self, id: ItemId) -> Result<Vec<PageAttempt>> {
        let rows = sqlx::query_as::<_, PageAttempt>(
            r"SELECT * FROM page_attempts
              WHERE item_id = ?
              ORDER BY id ASC",
        )
        .bind(id)
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows)
    }
}

#[derive(Debug, FromRow)]
struct ItemRow {
    id: i64,
    source_url: String,
    canonical_url: String,
    library: Option<String>,
    display_name: Option<String>,
    state: String,
    page_start: Option<i64>,
    page_end: Option<i64>,
    retry_count: i64,
    last_error: Option<String>,
    failure_kind: Option<String>,
    failure_message: Option<String>,
    failed_pages: Option<String>,
    outputs: String,
    created_at: i64,
    updated_at: i64,
}

impl ItemRow {
    fn into_item(self, pages: Vec<PageRef>) -> Result<QueueItem> {
        let state: ItemState = self
            .state
            .parse()
            .map_err(|_| QueueError::invalid_value("state", &self.state))?;

        let failure = match self.failure_kind {
            Some(kind) => {
                let kind: ErrorKind = kind
                    .parse()
                    .map_err(|_| QueueError::invalid_value("failure_kind", &kind))?;
                let pages: Vec<usize> = match self.failed_pages.as_deref() {
                    Some(raw) => serde_json::from_str(raw)?,
                    None => Vec::new(),
                };
                Some(ItemFailure {
                    kind,
                    message: self.failure_message.unwrap_or_default(),
                    pages,
                })
            }
            None => None,
        };

        let page_range = self
            .page_start
            .map(|start| {
                let bound = |value: i64| {
                    usize::try_from(value)
                        .map_err(|_| QueueError::invalid_value("page_range", value.to_string()))
                };
                let end = self.page_end.map(bound).transpose()?;
                PageRange::new(bound(start)?, end)
                    .map_err(|message| QueueError::invalid_value("page_range", message))
            })
            .transpose()?;

        let outputs: Vec<String> = serde_json::from_str(&self.outputs)?;

        Ok(QueueItem {
            id: self.id,
            source_url: self.source_url,
            canonical_url: self.canonical_url,
            library: self.library,
            display_name: self.display_name,
            state,
            page_range,
            pages,
            retry_count: u32::try_from(self.retry_count).unwrap_or(u32::MAX),
            last_error: self.last_error,
            failure,
            outputs: outputs.into_iter().map(PathBuf::from).collect(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct PageRow {
    item_id: i64,
    page_index: i64,
    url: String,
    label: String,
    expected_kind: String,
    status: String,
    attempt: i64,
    byte_size: Option<i64>,
    local_path: Option<String>,
    sha256: Option<String>,
    retry_at: Option<i64>,
    error_kind: Option<String>,
    last_error: Option<String>,
}

impl PageRow {
    fn into_page(self) -> Result<PageRef> {
        let index = usize::try_from(self.page_index)
            .map_err(|_| QueueError::invalid_value("page_index", self.page_index.to_string()))?;
        let expected: ExpectedKind = self
            .expected_kind
            .parse()
            .map_err(|_| QueueError::invalid_value("expected_kind", &self.expected_kind))?;
        let status: PageStatus = self
            .status
            .parse()
            .map_err(|_| QueueError::invalid_value("status", &self.status))?;
        let error_kind = self
            .error_kind
            .map(|kind| {
                kind.parse::<ErrorKind>()
                    .map_err(|_| QueueError::invalid_value("error_kind", &kind))
            })
            .transpose()?;

        Ok(PageRef {
            index,
            url: self.url,
            label: self.label,
            expected,
            status,
            attempt: u32::try_from(self.attempt).unwrap_or(0),
            byte_size: self.byte_size.and_then(|size| u64::try_from(size).ok()),
            local_path: self.local_path.map(PathBuf::from),
            sha256: self.sha256,
            retry_at: self.retry_at,
            error_kind,
            last_error: self.last_error,
        })
    }
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn u64_to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
