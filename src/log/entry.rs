//! Log entries and their ordering

use std::cmp::Ordering;
use std::sync::Arc;

use crate::protocol::{Timestamp, TraceRecord};

/// Severity of a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    Info,
    Error,
}

/// A trace line stored in the master log
///
/// Text is reference counted so the display can hold on to rows without
/// copying; evicting an entry drops the log's reference.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// OS process id of the sender
    pub process_id: u32,
    /// Server-assigned surrogate id of the sending connection
    pub unique_process_id: u32,
    pub unique_thread_id: u32,
    pub thread_id: u32,
    pub kind: EntryKind,
    pub timestamp: Timestamp,
    /// High-resolution counter in milliseconds, 0 when the client has none
    pub counter: f64,
    pub source_file: Arc<str>,
    pub message: Arc<str>,
    pub source_line: u32,
    /// Arrival order, assigned when the entry enters the master log
    pub sequence_index: u64,
}

impl LogEntry {
    /// Build a not-yet-sequenced entry from a decoded record
    pub fn from_record(
        process_id: u32,
        unique_process_id: u32,
        kind: EntryKind,
        record: TraceRecord,
    ) -> Self {
        Self {
            process_id,
            unique_process_id,
            unique_thread_id: record.unique_thread_id,
            thread_id: record.thread_id,
            kind,
            timestamp: record.timestamp,
            counter: record.counter,
            source_file: record.source_file.into(),
            message: record.text.into(),
            source_line: record.source_line,
            sequence_index: 0,
        }
    }

    /// Position of `self` relative to `other` in the master log
    ///
    /// Counters decide when either entry has one. Otherwise the wall-clock
    /// timestamps decide, year down to millisecond. Arrival order breaks ties.
    pub fn order(&self, other: &Self) -> Ordering {
        let primary = if self.counter != 0.0 || other.counter != 0.0 {
            self.counter.total_cmp(&other.counter)
        } else {
            self.timestamp.chronological_cmp(&other.timestamp)
        };
        primary.then(self.sequence_index.cmp(&other.sequence_index))
    }

    /// Whether `self` belongs strictly before `other`
    pub fn precedes(&self, other: &Self) -> bool {
        self.order(other) == Ordering::Less
    }

    pub fn is_error(&self) -> bool {
        self.kind == EntryKind::Error
    }
}
