//! Page dispatch under global and per-library concurrency limits.
//!
//! Items are served in insertion order within a library, libraries are served
//! round-robin, and every dispatched page holds one global and one library
//! permit until its [`DispatchPermit`] is dropped.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};

use crate::library::PolicyTable;
use crate::queue::{ItemId, ItemState, QueueItem};

/// Slots held by one in-flight page fetch; dropping it frees both.
#[derive(Debug)]
pub struct DispatchPermit {
    _global: OwnedSemaphorePermit,
    _library: OwnedSemaphorePermit,
}

/// A page chosen for dispatch, with its slots already acquired.
#[derive(Debug)]
pub struct Dispatch {
    pub item_id: ItemId,
    pub page_index: usize,
    /// Normalized library key.
    pub library: String,
    pub permit: DispatchPermit,
}

/// Chooses which eligible pages may start now.
pub struct Scheduler {
    global: Arc<Semaphore>,
    libraries: DashMap<String, Arc<Semaphore>>,
    policies: Arc<PolicyTable>,
    last_served: Option<String>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("global_available", &self.global.available_permits())
            .field("libraries", &self.libraries.len())
            .field("last_served", &self.last_served)
            .finish()
    }
}

impl Scheduler {
    /// Creates a scheduler allowing `global_max` concurrent fetches overall.
    #[must_use]
    pub fn new(global_max: usize, policies: Arc<PolicyTable>) -> Self {
        Self {
            global: Arc::new(Semaphore::new(global_max.max(1))),
            libraries: DashMap::new(),
            policies,
            last_served: None,
        }
    }

    /// Global slots currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.global.available_permits()
    }

    /// Picks every page that can start at `now` (unix millis).
    ///
    /// `items` must be in id order. Only `Downloading` and `RetryWait` items
    /// are considered. Stops as soon as the global limit is reached.
    pub fn select(&mut self, items: &[QueueItem], now: i64) -> Vec<Dispatch> {
        let mut queues = eligible_by_library(items, now);
        if queues.is_empty() {
            return Vec::new();
        }

        if let Some(last) = &self.last_served
            && let Some(position) = queues.iter().position(|(library, _)| library == last)
        {
            queues.rotate_left(position + 1);
        }

        let mut dispatched = Vec::new();
        loop {
            let mut progressed = false;

            for (library, pending) in &mut queues {
                if pending.is_empty() {
                    continue;
                }
                let Ok(global) = Arc::clone(&self.global).try_acquire_owned() else {
                    trace!(dispatched = dispatched.len(), "global limit reached");
                    return self.finish(dispatched);
                };
                let Ok(library_permit) = self.library_semaphore(library).try_acquire_owned()
                else {
                    trace!(library = %library, "library limit reached");
                    pending.clear();
                    continue;
                };
                let Some((item_id, page_index)) = pending.pop_front() else {
                    continue;
                };

                debug!(item_id, page_index, library = %library, "page dispatched");
                dispatched.push(Dispatch {
                    item_id,
                    page_index,
                    library: library.clone(),
                    permit: DispatchPermit {
                        _global: global,
                        _library: library_permit,
                    },
                });
                progressed = true;
            }

            if !progressed {
                return self.finish(dispatched);
            }
        }
    }

    fn finish(&mut self, dispatched: Vec<Dispatch>) -> Vec<Dispatch> {
        if let Some(last) = dispatched.last() {
            self.last_served = Some(last.library.clone());
        }
        dispatched
    }

    fn library_semaphore(&self, library: &str) -> Arc<Semaphore> {
        let entry = self
            .libraries
            .entry(library.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.policies.get(library).concurrency())));
        Arc::clone(entry.value())
    }
}

/// Groups eligible pages per library, libraries ordered by their oldest item.
fn eligible_by_library(items: &[QueueItem], now: i64) -> Vec<(String, VecDeque<(ItemId, usize)>)> {
    let mut queues: Vec<(String, VecDeque<(ItemId, usize)>)> = Vec::new();

    for item in items
        .iter()
        .filter(|item| matches!(item.state, ItemState::Downloading | ItemState::RetryWait))
    {
        let library = item.library_key();
        let position = match queues.iter().position(|(key, _)| *key == library) {
            Some(position) => position,
            None => {
                queues.push((library, VecDeque::new()));
                queues.len() - 1
            }
        };
        queues[position]
            .1
            .extend(item.eligible_pages(now).map(|index| (item.id, index)));
    }

    queues.retain(|(_, pending)| !pending.is_empty());
    queues
}
