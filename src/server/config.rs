//! Server configuration

use std::time::Duration;

use crate::protocol::constants::*;

/// Server configuration options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum entries staged between workers and the aggregator
    pub cache_capacity: usize,

    /// Period of the aggregator's flush timer
    pub flush_interval: Duration,

    /// How long the server waits for a client to confirm an offered channel
    pub communication_timeout: Duration,

    /// Buffer size of server-created channels, in KiB
    pub pipe_size_kb: u32,

    /// Retention cap for the master log (None = unlimited)
    pub max_log_entries: Option<usize>,

    /// Clear the master log when a new process connects
    pub auto_clear_on_connect: bool,

    /// How long workers get to stop on their own during shutdown
    pub shutdown_grace: Duration,

    /// Stop the whole server when the decode path runs out of memory
    pub shutdown_on_low_memory: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            communication_timeout: COMMUNICATION_TIMEOUT,
            pipe_size_kb: DEFAULT_PIPE_SIZE_KB,
            max_log_entries: None,
            auto_clear_on_connect: false,
            shutdown_grace: Duration::from_secs(1),
            shutdown_on_low_memory: true,
        }
    }
}

impl ServerConfig {
    /// Set cache capacity
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity.max(1);
        self
    }

    /// Set flush interval
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set communication timeout
    pub fn communication_timeout(mut self, timeout: Duration) -> Self {
        self.communication_timeout = timeout;
        self
    }

    /// Set channel buffer size in KiB
    pub fn pipe_size_kb(mut self, size: u32) -> Self {
        self.pipe_size_kb = size.max(1);
        self
    }

    /// Cap the master log, clamped to the supported range
    pub fn max_log_entries(mut self, max: usize) -> Self {
        self.max_log_entries = Some(max.clamp(MIN_LOG_ENTRIES, MAX_LOG_ENTRIES));
        self
    }

    /// Remove the retention cap
    pub fn unlimited_log(mut self) -> Self {
        self.max_log_entries = None;
        self
    }

    /// Clear the log whenever a new process connects
    pub fn auto_clear_on_connect(mut self, enabled: bool) -> Self {
        self.auto_clear_on_connect = enabled;
        self
    }

    /// Set shutdown grace period
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Keep running after a low-memory condition
    pub fn survive_low_memory(mut self) -> Self {
        self.shutdown_on_low_memory = false;
        self
    }
}
