//! Per-item progress aggregation.
//!
//! The engine reports page and state events into a [`ProgressHandle`]; a
//! background task folds them into per-item [`ProgressUpdate`]s and publishes
//! the changed ones on a fixed interval through a broadcast channel. Terminal
//! state changes are published immediately. Progress is derived data only,
//! the queue store stays authoritative.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::failure::ErrorKind;
use crate::queue::{ItemId, ItemState};

/// Default publish interval.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Sliding window used for throughput.
pub const THROUGHPUT_WINDOW: Duration = Duration::from_secs(10);

const BROADCAST_CAPACITY: usize = 256;

/// Input to the aggregator.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// Item changed state; carries the current page totals.
    ItemState {
        item_id: ItemId,
        state: ItemState,
        downloaded_pages: usize,
        total_pages: usize,
        downloaded_bytes: u64,
    },
    PageStarted {
        item_id: ItemId,
        page_index: usize,
    },
    PageValidated {
        item_id: ItemId,
        page_index: usize,
        bytes: u64,
    },
    PageFailed {
        item_id: ItemId,
        page_index: usize,
        kind: ErrorKind,
        /// False while the page still has attempts left.
        terminal: bool,
    },
    /// An attempt ended without changing the page (cancelled, superseded or
    /// already recorded).
    PageReleased {
        item_id: ItemId,
        page_index: usize,
    },
}

/// Published per-item aggregate.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub item_id: ItemId,
    pub state: ItemState,
    pub downloaded_pages: usize,
    pub total_pages: usize,
    pub downloaded_bytes: u64,
    /// Pages currently being fetched.
    pub active_pages: usize,
    /// Bytes per second over the throughput window.
    pub bytes_per_second: f64,
    /// `None` until there is throughput to extrapolate from.
    pub eta_seconds: Option<f64>,
}

#[derive(Debug)]
struct ItemProgress {
    state: ItemState,
    downloaded_pages: usize,
    total_pages: usize,
    downloaded_bytes: u64,
    active_pages: usize,
    samples: VecDeque<(Instant, u64)>,
    dirty: bool,
}

impl ItemProgress {
    fn new() -> Self {
        Self {
            state: ItemState::Pending,
            downloaded_pages: 0,
            total_pages: 0,
            downloaded_bytes: 0,
            active_pages: 0,
            samples: VecDeque::new(),
            dirty: false,
        }
    }
}

/// Pure progress bookkeeping; time is passed in by the caller.
#[derive(Debug)]
pub struct ProgressTracker {
    window: Duration,
    items: HashMap<ItemId, ItemProgress>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(THROUGHPUT_WINDOW)
    }
}

impl ProgressTracker {
    /// Creates a tracker with the given throughput window.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window: window.max(Duration::from_millis(1)),
            items: HashMap::new(),
        }
    }

    /// Folds one event in. Returns an update to publish right away when the
    /// item reached a terminal state.
    pub fn apply(&mut self, event: ProgressEvent, now: Instant) -> Option<ProgressUpdate> {
        match event {
            ProgressEvent::ItemState {
                item_id,
                state,
                downloaded_pages,
                total_pages,
                downloaded_bytes,
            } => {
                let entry = self.items.entry(item_id).or_insert_with(ItemProgress::new);
                entry.state = state;
                entry.downloaded_pages = downloaded_pages;
                entry.total_pages = total_pages;
                entry.downloaded_bytes = downloaded_bytes;
                entry.dirty = true;
                if matches!(
                    state,
                    ItemState::Resolving | ItemState::Assembling | ItemState::Paused
                ) || state.is_terminal()
                {
                    entry.active_pages = 0;
                }

                if state.is_terminal() {
                    let update = self.snapshot(item_id, now);
                    self.items.remove(&item_id);
                    return update;
                }
            }
            ProgressEvent::PageStarted { item_id, .. } => {
                let entry = self.items.entry(item_id).or_insert_with(ItemProgress::new);
                entry.active_pages += 1;
                entry.dirty = true;
            }
            ProgressEvent::PageValidated { item_id, bytes, .. } => {
                let entry = self.items.entry(item_id).or_insert_with(ItemProgress::new);
                entry.active_pages = entry.active_pages.saturating_sub(1);
                entry.downloaded_pages += 1;
                entry.downloaded_bytes += bytes;
                entry.samples.push_back((now, bytes));
                entry.dirty = true;
            }
            ProgressEvent::PageFailed { item_id, .. } => {
                let entry = self.items.entry(item_id).or_insert_with(ItemProgress::new);
                entry.active_pages = entry.active_pages.saturating_sub(1);
                entry.dirty = true;
            }
            ProgressEvent::PageReleased { item_id, .. } => {
                if let Some(entry) = self.items.get_mut(&item_id)
                    && entry.active_pages > 0
                {
                    entry.active_pages -= 1;
                    entry.dirty = true;
                }
            }
        }
        None
    }

    /// Current aggregate for one item.
    pub fn snapshot(&mut self, item_id: ItemId, now: Instant) -> Option<ProgressUpdate> {
        let window = self.window;
        let entry = self.items.get_mut(&item_id)?;
        Some(build_update(item_id, entry, window, now))
    }

    /// Returns updates for every item changed since the last drain.
    pub fn drain_dirty(&mut self, now: Instant) -> Vec<ProgressUpdate> {
        let window = self.window;
        let mut updates: Vec<ProgressUpdate> = self
            .items
            .iter_mut()
            .filter(|(_, entry)| entry.dirty)
            .map(|(item_id, entry)| {
                entry.dirty = false;
                build_update(*item_id, entry, window, now)
            })
            .collect();
        updates.sort_by_key(|update| update.item_id);
        updates
    }
}

#[allow(clippy::cast_precision_loss)]
fn build_update(
    item_id: ItemId,
    entry: &mut ItemProgress,
    window: Duration,
    now: Instant,
) -> ProgressUpdate {
    while entry
        .samples
        .front()
        .is_some_and(|(at, _)| now.saturating_duration_since(*at) > window)
    {
        entry.samples.pop_front();
    }

    let bytes_per_second = match entry.samples.front() {
        Some((oldest, _)) => {
            let span = now
                .saturating_duration_since(*oldest)
                .clamp(Duration::from_secs(1), window);
            let bytes: u64 = entry.samples.iter().map(|(_, bytes)| bytes).sum();
            bytes as f64 / span.as_secs_f64()
        }
        None => 0.0,
    };

    let remaining_pages = entry.total_pages.saturating_sub(entry.downloaded_pages);
    let eta_seconds = if remaining_pages == 0 && entry.total_pages > 0 {
        Some(0.0)
    } else if bytes_per_second > 0.0 && entry.downloaded_pages > 0 {
        let mean_page = entry.downloaded_bytes as f64 / entry.downloaded_pages as f64;
        Some(mean_page * remaining_pages as f64 / bytes_per_second)
    } else {
        None
    };

    ProgressUpdate {
        item_id,
        state: entry.state,
        downloaded_pages: entry.downloaded_pages,
        total_pages: entry.total_pages,
        downloaded_bytes: entry.downloaded_bytes,
        active_pages: entry.active_pages,
        bytes_per_second,
        eta_seconds,
    }
}

/// Spawns the aggregation task.
#[derive(Debug)]
pub struct ProgressAggregator;

impl ProgressAggregator {
    /// Starts aggregating; updates are published every `interval`.
    #[must_use]
    pub fn spawn(interval: Duration) -> ProgressHandle {
        let (events, mut receiver) = mpsc::unbounded_channel::<ProgressEvent>();
        let (updates, _) = broadcast::channel(BROADCAST_CAPACITY);
        let publisher = updates.clone();
        let interval = interval.max(Duration::from_millis(1));

        let task = tokio::spawn(async move {
            let mut tracker = ProgressTracker::default();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    event = receiver.recv() => {
                        let Some(event) = event else { break };
                        trace!(?event, "progress event");
                        if let Some(update) = tracker.apply(event, Instant::now()) {
                            let _ = publisher.send(update);
                        }
                    }
                    _ = ticker.tick() => {
                        for update in tracker.drain_dirty(Instant::now()) {
                            let _ = publisher.send(update);
                        }
                    }
                }
            }

            for update in tracker.drain_dirty(Instant::now()) {
                let _ = publisher.send(update);
            }
            debug!("progress aggregator stopped");
        });

        ProgressHandle {
            events,
            updates,
            task,
        }
    }
}

/// Input side and subscription point of a running aggregator.
#[derive(Debug)]
pub struct ProgressHandle {
    events: mpsc::UnboundedSender<ProgressEvent>,
    updates: broadcast::Sender<ProgressUpdate>,
    task: JoinHandle<()>,
}

impl ProgressHandle {
    /// Reports one event; silently dropped once the aggregator has stopped.
    pub fn report(&self, event: ProgressEvent) {
        let _ = self.events.send(event);
    }

    /// Subscribes to published updates.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.updates.subscribe()
    }

    /// Flushes pending updates and stops the task.
    pub async fn shutdown(self) {
        drop(self.events);
        let _ = self.task.await;
    }
}
