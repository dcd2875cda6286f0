//! State shared by the broker, the workers and the aggregator

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::log::{BoundedMessageCache, Directories, SharedLog};
use crate::registry::SessionRegistry;
use crate::stats::ServerStats;

use super::config::ServerConfig;
use super::context::ClientContext;

/// Notification posted to the aggregator task
///
/// Posting never blocks, so workers and the broker can report from anywhere.
#[derive(Debug)]
pub enum ServerEvent {
    /// A process connected that had no other active connection
    ProcessConnected(ClientContext),
    /// A worker exited
    ProcessDisconnected(ClientContext),
    ProcessesChanged,
    ThreadsChanged,
    /// A failure to surface on the display
    Failure(Error),
    /// Clear the master log
    Clear,
}

/// Everything the server's tasks share
pub struct ServerShared {
    pub config: ServerConfig,
    pub cache: BoundedMessageCache,
    pub directories: Directories,
    pub registry: SessionRegistry,
    pub log: SharedLog,
    pub stats: ServerStats,
    /// Cancelled to stop the whole server
    pub shutdown: CancellationToken,
    events: mpsc::UnboundedSender<ServerEvent>,
}

impl ServerShared {
    /// Build the shared state and the receiving end of its event queue
    pub fn new(config: ServerConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Self {
            cache: BoundedMessageCache::new(config.cache_capacity),
            directories: Directories::new(),
            registry: SessionRegistry::new(),
            log: SharedLog::new(config.max_log_entries),
            stats: ServerStats::new(),
            shutdown: CancellationToken::new(),
            events,
            config,
        });
        (shared, events_rx)
    }

    /// Queue an event for the aggregator
    pub fn post(&self, event: ServerEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("Event dropped, aggregator has stopped");
        }
    }
}
