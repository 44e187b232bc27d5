//! Shared helpers for integration tests: fake page payloads, mock library
//! servers with flaky or slow pages, and engines wired to a temp directory.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use manuscript_core::download::BackoffPolicy;
use manuscript_core::engine::{EngineSettings, Orchestrator};
use manuscript_core::library::{LibraryPolicy, PolicyTable};
use manuscript_core::queue::QueueStore;
use manuscript_core::resolver::{ManifestPage, ResolvedManifest, ResolverRegistry, StaticResolver};
use manuscript_core::Database;
use tempfile::TempDir;
use wiremock::matchers::{method, path_regex};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Size of every fake page body.
pub const PAGE_BYTES: usize = 2048;

/// JPEG-signed body whose filler byte encodes the page index.
pub fn page_body(index: usize) -> Vec<u8> {
    let mut body = vec![0xFF, 0xD8, 0xFF, 0xE0];
    let filler = u8::try_from(index % 251).expect("index fits in u8");
    body.resize(PAGE_BYTES, filler);
    body
}

/// URL path of page `index` of manuscript `ms`.
pub fn page_path(ms: &str, index: usize) -> String {
    format!("/{ms}/page/{index}.jpg")
}

/// Manifest of `count` pages served by `server_uri`.
pub fn manifest(server_uri: &str, ms: &str, count: usize, library: &str) -> ResolvedManifest {
    ResolvedManifest {
        display_name: format!("Manuscript {ms}"),
        library: library.to_string(),
        pages: (0..count)
            .map(|index| {
                ManifestPage::new(
                    format!("{server_uri}{}", page_path(ms, index)),
                    format!("f{}", index + 1),
                )
            })
            .collect(),
    }
}

/// Per-page behaviour of a [`PageServer`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PageBehavior {
    /// Requests answered with 503 before the page succeeds.
    pub failures: usize,
    /// Delay before answering while the server is in slow mode.
    pub slow: bool,
}

/// Serves `/<ms>/page/<index>.jpg`, counting requests per path.
#[derive(Clone)]
pub struct PageServer {
    behaviors: Arc<Mutex<HashMap<String, PageBehavior>>>,
    counts: Arc<Mutex<HashMap<String, usize>>>,
    slow_mode: Arc<AtomicBool>,
    slow_delay: Duration,
}

impl PageServer {
    pub fn new(slow_delay: Duration) -> Self {
        Self {
            behaviors: Arc::default(),
            counts: Arc::default(),
            slow_mode: Arc::new(AtomicBool::new(true)),
            slow_delay,
        }
    }

    pub fn set(&self, ms: &str, index: usize, behavior: PageBehavior) {
        self.behaviors
            .lock()
            .expect("behaviors lock")
            .insert(page_path(ms, index), behavior);
    }

    /// Slow pages answer immediately from now on.
    pub fn disable_slow_mode(&self) {
        self.slow_mode.store(false, Ordering::SeqCst);
    }

    pub fn requests(&self, ms: &str, index: usize) -> usize {
        self.counts
            .lock()
            .expect("counts lock")
            .get(&page_path(ms, index))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_requests(&self) -> usize {
        self.counts.lock().expect("counts lock").values().sum()
    }

    pub async fn mount(&self, server: &MockServer) {
        Mock::given(method("GET"))
            .and(path_regex(r"^/[^/]+/page/\d+\.jpg$"))
            .respond_with(self.clone())
            .mount(server)
            .await;
    }
}

impl Respond for PageServer {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let path = request.url.path().to_string();
        let seen = {
            let mut counts = self.counts.lock().expect("counts lock");
            let count = counts.entry(path.clone()).or_insert(0);
            *count += 1;
            *count
        };
        let behavior = self
            .behaviors
            .lock()
            .expect("behaviors lock")
            .get(&path)
            .copied()
            .unwrap_or_default();

        if seen <= behavior.failures {
            return ResponseTemplate::new(503).set_body_string("busy");
        }

        let index: usize = path
            .rsplit('/')
            .next()
            .and_then(|file| file.strip_suffix(".jpg"))
            .and_then(|index| index.parse().ok())
            .unwrap_or(0);
        let response = ResponseTemplate::new(200)
            .insert_header("content-type", "image/jpeg")
            .set_body_bytes(page_body(index));

        if behavior.slow && self.slow_mode.load(Ordering::SeqCst) {
            response.set_delay(self.slow_delay)
        } else {
            response
        }
    }
}

/// Policies with millisecond backoff so retries do not slow the suite down.
pub fn fast_policy() -> LibraryPolicy {
    LibraryPolicy {
        backoff: BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(40)),
        ..LibraryPolicy::default()
    }
}

pub fn fast_policies() -> PolicyTable {
    PolicyTable::new(fast_policy())
}

/// Settings writing artifacts to `<dir>/out` and staging under `<dir>/state`.
pub fn test_settings(dir: &Path) -> EngineSettings {
    let mut settings = EngineSettings::new(dir.join("out"), dir.join("state"));
    settings.progress_interval = Duration::from_millis(20);
    settings.request_timeout = Duration::from_secs(10);
    settings
}

pub fn db_path(dir: &Path) -> PathBuf {
    dir.join("state").join("queue.db")
}

pub async fn open_store(dir: &Path) -> QueueStore {
    std::fs::create_dir_all(dir.join("state")).expect("create state dir");
    let db = Database::new(&db_path(dir)).await.expect("open database");
    QueueStore::sqlite(db).await.expect("open queue store")
}

pub async fn open_engine(
    dir: &Path,
    settings: EngineSettings,
    resolver: StaticResolver,
    policies: PolicyTable,
) -> Orchestrator {
    let store = open_store(dir).await;
    let mut resolvers = ResolverRegistry::new();
    resolvers.register(Box::new(resolver));
    Orchestrator::open(settings, store, resolvers, policies)
        .await
        .expect("open orchestrator")
}

pub fn temp_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp dir")
}

/// Polls `check` every 10 ms until it returns true or `limit` passes.
pub async fn wait_until<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Entry names and bodies of a zip artifact, in archive order.
pub fn zip_entries(path: &Path) -> Vec<(String, Vec<u8>)> {
    use std::io::Read;

    let file = std::fs::File::open(path).expect("open artifact");
    let mut archive = zip::ZipArchive::new(file).expect("read zip");
    (0..archive.len())
        .map(|i| {
            let mut entry = archive.by_index(i).expect("zip entry");
            let mut body = Vec::new();
            entry.read_to_end(&mut body).expect("read entry");
            (entry.name().to_string(), body)
        })
        .collect()
}
