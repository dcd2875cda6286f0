//! Log aggregator
//!
//! The single consumer of the message cache and the only caller of the
//! display. It wakes on the flush timer, on an early flush request from a
//! blocked producer, or on an event posted by the broker or a worker.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::Error;

use super::display::TraceDisplay;
use super::shared::{ServerEvent, ServerShared};

/// Drains the cache into the master log and forwards events to the display
pub struct LogAggregator<D: TraceDisplay> {
    shared: Arc<ServerShared>,
    display: Arc<D>,
    events: mpsc::UnboundedReceiver<ServerEvent>,
}

impl<D: TraceDisplay> LogAggregator<D> {
    pub fn new(
        shared: Arc<ServerShared>,
        display: Arc<D>,
        events: mpsc::UnboundedReceiver<ServerEvent>,
    ) -> Self {
        Self {
            shared,
            display,
            events,
        }
    }

    /// Run until `cancel` fires, then flush once more
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.shared.config.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.flush();
                }
                _ = self.shared.cache.flush_requested() => {
                    tracing::trace!("Early flush requested");
                    self.flush();
                }
                Some(event) = self.events.recv() => self.handle_event(event),
            }
        }

        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event);
        }
        self.flush();
        tracing::debug!("Aggregator stopped");
    }

    /// Move everything pending in the cache into the master log
    ///
    /// Returns the number of entries appended.
    pub fn flush(&self) -> usize {
        let batch = self.shared.cache.drain();
        if batch.is_empty() {
            self.shared.cache.complete_flush();
            return 0;
        }

        let (outcome, count) = {
            let mut log = self.shared.log.write();
            let outcome = log.append_batch(batch);
            (outcome, log.len())
        };
        self.shared.cache.complete_flush();
        self.shared
            .stats
            .record_flush(outcome.appended, outcome.evicted);

        if outcome.evicted > 0 {
            tracing::debug!(evicted = outcome.evicted, "Retention limit reached");
        }
        tracing::debug!(
            appended = outcome.appended,
            evicted = outcome.evicted,
            total = count,
            "Flushed cache"
        );

        self.display.set_count(count);
        if outcome.has_error {
            self.display.error_entry_received();
        }
        outcome.appended
    }

    fn clear(&self) {
        self.shared.log.write().clear();
        self.display.log_cleared();
        self.display.set_count(0);
    }

    fn handle_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::ProcessConnected(client) => {
                tracing::info!(
                    process_id = client.process_id,
                    unique_process_id = client.unique_process_id,
                    "Process connected"
                );
                if self.shared.config.auto_clear_on_connect {
                    // Entries already staged belong to the cleared session too
                    self.flush();
                    self.clear();
                }
                self.display.process_connected(&client);
            }
            ServerEvent::ProcessDisconnected(client) => {
                self.display.notify_disconnect(&client);
            }
            ServerEvent::ProcessesChanged => self.display.processes_changed(),
            ServerEvent::ThreadsChanged => self.display.threads_changed(),
            ServerEvent::Failure(error) => {
                let low_memory = matches!(error, Error::LowMemory);
                self.display.notify_error(&error);
                if low_memory && self.shared.config.shutdown_on_low_memory {
                    tracing::error!("Low memory, shutting down");
                    self.shared.shutdown.cancel();
                }
            }
            ServerEvent::Clear => {
                self.flush();
                self.clear();
            }
        }
    }
}
