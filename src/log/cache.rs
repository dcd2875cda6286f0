//! Bounded staging buffer between client workers and the aggregator
//!
//! Producers never drop entries. A producer that finds the cache full raises
//! a flush request (once per flush cycle) and waits for the aggregator to
//! signal completion, then retries.

use std::sync::{Mutex, MutexGuard};

use tokio::sync::{watch, Notify};

use super::entry::LogEntry;
use crate::protocol::constants::DEFAULT_CACHE_CAPACITY;

struct CacheState {
    entries: Vec<LogEntry>,
    flush_in_progress: bool,
}

/// Multi-producer, single-consumer cache of pending log entries
pub struct BoundedMessageCache {
    capacity: usize,
    state: Mutex<CacheState>,
    flush_requested: Notify,
    /// Bumped every time a flush completes
    flushed: watch::Sender<u64>,
}

impl BoundedMessageCache {
    /// Create a cache holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (flushed, _) = watch::channel(0);
        Self {
            capacity,
            state: Mutex::new(CacheState {
                entries: Vec::with_capacity(capacity),
                flush_in_progress: false,
            }),
            flush_requested: Notify::new(),
            flushed,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append an entry, waiting for a flush while the cache is full
    pub async fn push(&self, entry: LogEntry) {
        loop {
            let mut flush_done = {
                let mut state = self.lock();
                if state.entries.len() < self.capacity {
                    state.entries.push(entry);
                    return;
                }
                if !state.flush_in_progress {
                    state.flush_in_progress = true;
                    self.flush_requested.notify_one();
                }
                // Subscribed under the lock, so a completion that races with
                // this producer is still observed as a change.
                self.flushed.subscribe()
            };
            let _ = flush_done.changed().await;
        }
    }

    /// Resolves when a producer has requested an early flush
    pub async fn flush_requested(&self) {
        self.flush_requested.notified().await;
    }

    /// Take every pending entry, oldest first
    pub fn drain(&self) -> Vec<LogEntry> {
        let mut state = self.lock();
        std::mem::replace(&mut state.entries, Vec::with_capacity(self.capacity))
    }

    /// Release producers waiting on a full cache
    pub fn complete_flush(&self) {
        self.lock().flush_in_progress = false;
        self.flushed.send_modify(|epoch| *epoch = epoch.wrapping_add(1));
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for BoundedMessageCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl std::fmt::Debug for BoundedMessageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedMessageCache")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}
