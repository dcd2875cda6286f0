//! Statistics and metrics for trace ingestion

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Worker-level statistics
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Total bytes read from the channel
    pub bytes_read: u64,
    /// Messages decoded, of any kind
    pub messages: u64,
    /// Information and error lines pushed to the cache
    pub trace_lines: u64,
    /// Flow-control units returned to the client
    pub flow_units_released: u64,
    /// Connection duration
    pub duration: Duration,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Average message size in bytes
    pub fn average_message_size(&self) -> u64 {
        if self.messages > 0 {
            self.bytes_read / self.messages
        } else {
            0
        }
    }
}

/// Server-wide counters, updated concurrently
#[derive(Debug)]
pub struct ServerStats {
    started_at: Instant,
    handshakes_accepted: AtomicU64,
    handshakes_rejected: AtomicU64,
    stale_requests: AtomicU64,
    workers_finished: AtomicU64,
    bytes_read: AtomicU64,
    entries_aggregated: AtomicU64,
    entries_evicted: AtomicU64,
    flushes: AtomicU64,
}

/// Point-in-time copy of [`ServerStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStatsSnapshot {
    pub uptime_secs: u64,
    pub handshakes_accepted: u64,
    pub handshakes_rejected: u64,
    pub stale_requests: u64,
    pub workers_finished: u64,
    pub bytes_read: u64,
    pub entries_aggregated: u64,
    pub entries_evicted: u64,
    pub flushes: u64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            handshakes_accepted: AtomicU64::new(0),
            handshakes_rejected: AtomicU64::new(0),
            stale_requests: AtomicU64::new(0),
            workers_finished: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            entries_aggregated: AtomicU64::new(0),
            entries_evicted: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        }
    }

    pub fn record_handshake(&self, accepted: bool) {
        let counter = if accepted {
            &self.handshakes_accepted
        } else {
            &self.handshakes_rejected
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_request(&self) {
        self.stale_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold a finished worker's numbers in
    pub fn record_worker(&self, worker: &WorkerStats) {
        self.workers_finished.fetch_add(1, Ordering::Relaxed);
        self.bytes_read
            .fetch_add(worker.bytes_read, Ordering::Relaxed);
    }

    pub fn record_flush(&self, appended: usize, evicted: usize) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.entries_aggregated
            .fetch_add(appended as u64, Ordering::Relaxed);
        self.entries_evicted
            .fetch_add(evicted as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ServerStatsSnapshot {
        ServerStatsSnapshot {
            uptime_secs: self.started_at.elapsed().as_secs(),
            handshakes_accepted: self.handshakes_accepted.load(Ordering::Relaxed),
            handshakes_rejected: self.handshakes_rejected.load(Ordering::Relaxed),
            stale_requests: self.stale_requests.load(Ordering::Relaxed),
            workers_finished: self.workers_finished.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            entries_aggregated: self.entries_aggregated.load(Ordering::Relaxed),
            entries_evicted: self.entries_evicted.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}
