//! The ordered master log
//!
//! Batches drained from the cache are appended with fresh sequence numbers and
//! then moved into place by an insertion pass that starts at the first new
//! entry. The existing prefix is already ordered and new batches are usually
//! close to ordered, so the pass is cheap in practice.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::entry::LogEntry;

/// What a merge did to the log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub appended: usize,
    pub evicted: usize,
    /// At least one appended entry was an error
    pub has_error: bool,
}

/// Ordered, optionally capped sequence of log entries
#[derive(Debug, Default)]
pub struct MasterLog {
    entries: Vec<LogEntry>,
    next_sequence: u64,
    max_entries: Option<usize>,
}

impl MasterLog {
    /// Create an empty log, retaining at most `max_entries` if set
    pub fn new(max_entries: Option<usize>) -> Self {
        Self {
            entries: Vec::new(),
            next_sequence: 0,
            max_entries,
        }
    }

    /// Append a batch in arrival order and restore the ordering invariant
    ///
    /// When a retention cap is set, the lowest-ordered entries are evicted
    /// afterwards so exactly the highest-ordered `max_entries` remain.
    pub fn append_batch(&mut self, batch: Vec<LogEntry>) -> MergeOutcome {
        let mut outcome = MergeOutcome {
            appended: batch.len(),
            ..Default::default()
        };
        if batch.is_empty() {
            return outcome;
        }

        let first_new = self.entries.len();
        self.entries.reserve(batch.len());
        for mut entry in batch {
            outcome.has_error |= entry.is_error();
            entry.sequence_index = self.next_sequence;
            self.next_sequence += 1;
            self.entries.push(entry);
        }

        insertion_merge(&mut self.entries, first_new);

        if let Some(max) = self.max_entries {
            if self.entries.len() > max {
                let excess = self.entries.len() - max;
                self.entries.drain(..excess);
                outcome.evicted = excess;
            }
        }
        outcome
    }

    /// Drop every entry; sequence numbers keep counting
    pub fn clear(&mut self) {
        self.entries = Vec::new();
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<&LogEntry> {
        self.entries.get(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_entries(&self) -> Option<usize> {
        self.max_entries
    }

    /// Whether no entry precedes its predecessor
    pub fn is_ordered(&self) -> bool {
        self.entries.windows(2).all(|w| !w[1].precedes(&w[0]))
    }
}

/// Move each entry from `first_new` on backwards past everything it precedes
fn insertion_merge(entries: &mut [LogEntry], first_new: usize) {
    for current in first_new.max(1)..entries.len() {
        let mut position = current;
        while position > 0 && entries[current].precedes(&entries[position - 1]) {
            position -= 1;
        }
        if position < current {
            entries[position..=current].rotate_right(1);
        }
    }
}

/// Master log shared between the aggregator and readers
#[derive(Debug, Default)]
pub struct SharedLog {
    inner: RwLock<MasterLog>,
}

impl SharedLog {
    pub fn new(max_entries: Option<usize>) -> Self {
        Self {
            inner: RwLock::new(MasterLog::new(max_entries)),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, MasterLog> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, MasterLog> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Copy of the current entries, for readers that must not hold the lock
    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.read().entries().to_vec()
    }
}
