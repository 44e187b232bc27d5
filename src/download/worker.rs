//! Fixed-size pool of fetch workers.
//!
//! Each [`FetchTask`] is exactly one attempt at one page: fetch, validate,
//! store. The worker drops the task's dispatch permit as soon as the attempt
//! ends, then reports a [`WorkerEvent`]; it never sleeps through a backoff
//! itself, the engine re-dispatches the page once `retry_at` passes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::client::PageClient;
use super::error::FetchError;
use super::retry::{RetryDecision, RetryPolicy, random_jitter};
use super::validate::{PageValidator, PayloadKind};
use crate::engine::DispatchPermit;
use crate::failure::ErrorKind;
use crate::queue::{ExpectedKind, ItemId};

/// One attempt at one page.
#[derive(Debug)]
pub struct FetchTask {
    pub item_id: ItemId,
    pub page_index: usize,
    pub url: String,
    pub expected: ExpectedKind,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Directory receiving the stored page.
    pub staging_dir: PathBuf,
    /// Per-request deadline.
    pub timeout: Duration,
    pub retry: RetryPolicy,
    /// Cancelled when the owning item is cancelled or failed.
    pub cancel: CancellationToken,
    /// Released when the attempt ends.
    pub permit: DispatchPermit,
}

/// How an attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// Page stored at `local_path`.
    Validated {
        local_path: PathBuf,
        byte_size: u64,
        /// Hex SHA-256 of the stored bytes.
        sha256: String,
        payload: PayloadKind,
    },
    /// Attempt failed; the page may be retried after `delay`.
    RetryScheduled {
        delay: Duration,
        kind: ErrorKind,
        error: String,
        http_status: Option<u16>,
    },
    /// Attempt failed and the page has no attempts left.
    Exhausted {
        kind: ErrorKind,
        error: String,
        http_status: Option<u16>,
    },
    /// The owning item was cancelled mid-attempt.
    Cancelled,
}

/// Report sent by a worker after each attempt.
#[derive(Debug, Clone)]
pub struct WorkerEvent {
    pub item_id: ItemId,
    pub page_index: usize,
    pub attempt: u32,
    /// Wall time of the attempt.
    pub duration: Duration,
    pub outcome: FetchOutcome,
}

/// The pool no longer accepts tasks.
#[derive(Debug, Error)]
#[error("worker pool is shut down")]
pub struct PoolClosed;

/// Shared state handed to every worker task.
#[derive(Debug, Clone)]
struct WorkerContext {
    client: PageClient,
    validator: PageValidator,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

/// Fixed set of tasks pulling [`FetchTask`]s from one shared queue.
#[derive(Debug)]
pub struct WorkerPool {
    sender: mpsc::Sender<FetchTask>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Starts `size` workers. `capacity` bounds the task queue.
    #[must_use]
    pub fn spawn(
        size: usize,
        capacity: usize,
        client: PageClient,
        validator: PageValidator,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let context = WorkerContext {
            client,
            validator,
            events,
        };

        let handles = (0..size.max(1))
            .map(|worker_id| {
                let receiver = Arc::clone(&receiver);
                let context = context.clone();
                tokio::spawn(worker_loop(worker_id, receiver, context))
            })
            .collect();

        info!(workers = size.max(1), "worker pool started");
        Self { sender, handles }
    }

    /// Queues a task for the next free worker.
    ///
    /// # Errors
    ///
    /// Returns [`PoolClosed`] if every worker has exited.
    pub async fn submit(&self, task: FetchTask) -> Result<(), PoolClosed> {
        self.sender.send(task).await.map_err(|_| PoolClosed)
    }

    /// Stops accepting tasks and waits for running attempts to finish.
    pub async fn shutdown(self) {
        drop(self.sender);
        for handle in self.handles {
            if let Err(error) = handle.await {
                warn!(error = %error, "worker task ended abnormally");
            }
        }
        debug!("worker pool stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    receiver: Arc<Mutex<mpsc::Receiver<FetchTask>>>,
    context: WorkerContext,
) {
    loop {
        let next = receiver.lock().await.recv().await;
        let Some(task) = next else {
            break;
        };
        let event = run_attempt(worker_id, task, &context.client, &context.validator).await;
        if context.events.send(event).is_err() {
            debug!(worker_id, "event receiver dropped, worker exiting");
            break;
        }
    }
}

#[instrument(
    skip(task, client, validator),
    fields(item_id = task.item_id, page_index = task.page_index, attempt = task.attempt)
)]
async fn run_attempt(
    worker_id: usize,
    task: FetchTask,
    client: &PageClient,
    validator: &PageValidator,
) -> WorkerEvent {
    let started = Instant::now();
    let FetchTask {
        item_id,
        page_index,
        url,
        expected,
        attempt,
        staging_dir,
        timeout,
        retry,
        cancel,
        permit,
    } = task;

    let result = fetch_and_store(
        client,
        validator,
        &url,
        expected,
        page_index,
        &staging_dir,
        timeout,
        &cancel,
    )
    .await;
    drop(permit);

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(error) => classify_failure(&error, attempt, &retry),
    };

    WorkerEvent {
        item_id,
        page_index,
        attempt,
        duration: started.elapsed(),
        outcome,
    }
}

/// Turns a failed attempt into a retry or an exhausted outcome.
fn classify_failure(error: &FetchError, attempt: u32, retry: &RetryPolicy) -> FetchOutcome {
    if matches!(error, FetchError::Cancelled { .. }) {
        return FetchOutcome::Cancelled;
    }

    let kind = error.kind();
    let http_status = error.http_status_code();
    match retry.decide(error, attempt, random_jitter()) {
        RetryDecision::Retry { delay, .. } => {
            info!(kind = %kind, delay_ms = delay.as_millis(), error = %error, "page attempt failed, retrying");
            FetchOutcome::RetryScheduled {
                delay,
                kind,
                error: error.to_string(),
                http_status,
            }
        }
        RetryDecision::DoNotRetry { reason } => {
            warn!(kind = %kind, reason = %reason, error = %error, "page failed");
            FetchOutcome::Exhausted {
                kind,
                error: format!("{error} ({reason})"),
                http_status,
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn fetch_and_store(
    client: &PageClient,
    validator: &PageValidator,
    url: &str,
    expected: ExpectedKind,
    page_index: usize,
    staging_dir: &Path,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<FetchOutcome, FetchError> {
    let page = client.fetch(url, timeout, cancel).await?;
    let payload = validator
        .validate(&page.body, page.content_type.as_deref(), expected)
        .map_err(|failure| FetchError::integrity(url, failure))?;

    if cancel.is_cancelled() {
        return Err(FetchError::cancelled(url));
    }

    let local_path = store_page(staging_dir, page_index, payload, &page.body).await?;
    let sha256 = format!("{:x}", Sha256::digest(&page.body));
    debug!(path = %local_path.display(), bytes = page.body.len(), "page stored");

    Ok(FetchOutcome::Validated {
        local_path,
        byte_size: page.body.len() as u64,
        sha256,
        payload,
    })
}

/// Writes `body` to `page_<index>.part`, syncs it and renames it into place.
async fn store_page(
    staging_dir: &Path,
    page_index: usize,
    payload: PayloadKind,
    body: &[u8],
) -> Result<PathBuf, FetchError> {
    tokio::fs::create_dir_all(staging_dir)
        .await
        .map_err(|e| FetchError::io(staging_dir, e))?;

    let part_path = staging_dir.join(format!("page_{page_index:04}.part"));
    let final_path = staging_dir.join(format!("page_{page_index:04}.{}", payload.extension()));

    let mut file = tokio::fs::File::create(&part_path)
        .await
        .map_err(|e| FetchError::io(&part_path, e))?;
    let written = async {
        file.write_all(body).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    drop(file);

    if let Err(error) = written {
        let _ = tokio::fs::remove_file(&part_path).await;
        return Err(FetchError::io(&part_path, error));
    }

    tokio::fs::rename(&part_path, &final_path)
        .await
        .map_err(|e| FetchError::io(&final_path, e))?;
    Ok(final_path)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::download::BackoffPolicy;
    use crate::engine::Scheduler;
    use crate::library::PolicyTable;
    use crate::queue::{ItemState, PageRef, QueueItem};
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn jpeg(len: usize) -> Vec<u8> {
        let mut body = vec![0xFF, 0xD8, 0xFF, 0xE0];
        body.resize(len, 0x11);
        body
    }

    fn permit() -> DispatchPermit {
        let item = QueueItem {
            id: 1,
            source_url: "https://lib.example/1".into(),
            canonical_url: "https://lib.example/1".into(),
            library: None,
            display_name: None,
            state: ItemState::Downloading,
            page_range: None,
            pages: vec![PageRef::new(0, "https://lib.example/p0.jpg", "")],
            retry_count: 0,
            last_error: None,
            failure: None,
            outputs: Vec::new(),
            created_at: 0,
            updated_at: 0,
        };
        let mut scheduler = Scheduler::new(1, Arc::new(PolicyTable::default()));
        scheduler.select(&[item], 0).pop().unwrap().permit
    }

    fn task(url: String, staging_dir: PathBuf, attempt: u32, retry_limit: u32) -> FetchTask {
        FetchTask {
            item_id: 1,
            page_index: 0,
            url,
            expected: ExpectedKind::Image,
            attempt,
            staging_dir,
            timeout: Duration::from_secs(5),
            retry: RetryPolicy::new(
                retry_limit,
                BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(100)),
            ),
            cancel: CancellationToken::new(),
            permit: permit(),
        }
    }

    async fn run_one(task: FetchTask) -> WorkerEvent {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::spawn(1, 1, PageClient::new().unwrap(), PageValidator::default(), events_tx);
        pool.submit(task).await.unwrap();
        let event = events_rx.recv().await.unwrap();
        pool.shutdown().await;
        event
    }

    #[tokio::test]
    async fn test_validated_page_is_stored_atomically() {
        let server = MockServer::start().await;
        let body = jpeg(2048);
        Mock::given(method("GET"))
            .and(path("/p0.jpg"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Type", "image/jpeg")
                    .set_body_bytes(body.clone()),
            )
            .mount(&server)
            .await;
        let dir = TempDir::new().unwrap();

        let event = run_one(task(
            format!("{}/p0.jpg", server.uri()),
            dir.path().join("pages"),
            1,
            3,
        ))
        .await;

        let FetchOutcome::Validated {
            local_path,
            byte_size,
            sha256,
            payload,
        } = event.outcome
        else {
            panic!("expected validated outcome, got {:?}", event.outcome);
        };
        assert_eq!(local_path, dir.path().join("pages").join("page_0000.jpg"));
        assert_eq!(byte_size, 2048);
        assert_eq!(payload, PayloadKind::Jpeg);
        assert_eq!(sha256.len(), 64);
        assert_eq!(std::fs::read(&local_path).unwrap(), body);
        assert!(!dir.path().join("pages").join("page_0000.part").exists());
    }

    #[tokio::test]
    async fn test_server_error_schedules_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let dir = TempDir::new().unwrap();

        let event = run_one(task(format!("{}/p0.jpg", server.uri()), dir.path().into(), 1, 3)).await;

        let FetchOutcome::RetryScheduled {
            delay,
            kind,
            http_status,
            ..
        } = event.outcome
        else {
            panic!("expected retry, got {:?}", event.outcome);
        };
        assert_eq!(kind, ErrorKind::Server);
        assert_eq!(http_status, Some(503));
        assert!(delay >= Duration::from_millis(10) && delay <= Duration::from_millis(13));
    }

    #[tokio::test]
    async fn test_last_attempt_is_exhausted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let dir = TempDir::new().unwrap();

        let event = run_one(task(format!("{}/p0.jpg", server.uri()), dir.path().into(), 4, 3)).await;
        assert!(matches!(
            event.outcome,
            FetchOutcome::Exhausted {
                kind: ErrorKind::Server,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_not_found_is_exhausted_immediately() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let dir = TempDir::new().unwrap();

        let event = run_one(task(format!("{}/p0.jpg", server.uri()), dir.path().into(), 1, 3)).await;
        let FetchOutcome::Exhausted { error, .. } = event.outcome else {
            panic!("expected exhausted, got {:?}", event.outcome);
        };
        assert!(error.contains("404"));
    }

    #[tokio::test]
    async fn test_html_placeholder_is_integrity_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Type", "text/html")
                    .set_body_string("<html>".repeat(400)),
            )
            .mount(&server)
            .await;
        let dir = TempDir::new().unwrap();

        let event = run_one(task(format!("{}/p0.jpg", server.uri()), dir.path().into(), 1, 3)).await;
        assert!(matches!(
            event.outcome,
            FetchOutcome::RetryScheduled {
                kind: ErrorKind::Integrity,
                ..
            }
        ));
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_cancelled_attempt_reports_cancelled() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;
        let dir = TempDir::new().unwrap();
        let task = task(format!("{}/p0.jpg", server.uri()), dir.path().into(), 1, 3);
        task.cancel.cancel();

        let event = run_one(task).await;
        assert_eq!(event.outcome, FetchOutcome::Cancelled);
    }
}
