//! Session registry implementation

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::entry::{WorkerHandle, WorkerTicket};
use super::error::RegistryError;
use crate::protocol::ProtocolGeneration;

/// Outcome of [`SessionRegistry::shutdown`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Workers asked to stop
    pub cancelled: usize,
    /// Workers still running after the grace period and aborted
    pub aborted: usize,
}

/// Registry of all active client workers
///
/// Thread-safe via `RwLock`. The broker reads it on every handshake, workers
/// write it once when they exit.
pub struct SessionRegistry {
    /// Map of worker id to worker handle
    workers: RwLock<HashMap<u64, WorkerHandle>>,

    next_worker_id: AtomicU64,
    next_unique_process_id: AtomicU32,

    /// Set once shutdown has begun
    closed: AtomicBool,

    /// Signalled when the last worker unregisters
    emptied: Notify,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            next_worker_id: AtomicU64::new(1),
            next_unique_process_id: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            emptied: Notify::new(),
        }
    }

    /// Whether no active worker serves `process_id`
    pub async fn is_new_process(&self, process_id: u32) -> bool {
        let workers = self.workers.read().await;
        !workers.values().any(|w| w.process_id() == process_id)
    }

    /// Register a worker for a freshly accepted connection
    ///
    /// Assigns the worker id and the surrogate unique process id.
    pub async fn register(
        &self,
        process_id: u32,
        generation: ProtocolGeneration,
    ) -> Result<WorkerTicket, RegistryError> {
        let mut workers = self.workers.write().await;
        if self.is_closed() {
            return Err(RegistryError::Closed);
        }

        let ticket = WorkerTicket {
            worker_id: self.next_worker_id.fetch_add(1, Ordering::Relaxed),
            process_id,
            unique_process_id: self.next_unique_process_id.fetch_add(1, Ordering::Relaxed),
            generation,
            cancel: CancellationToken::new(),
        };
        workers.insert(ticket.worker_id, WorkerHandle::new(ticket.clone()));

        tracing::info!(
            worker_id = ticket.worker_id,
            process_id = process_id,
            unique_process_id = ticket.unique_process_id,
            generation = %generation,
            active = workers.len(),
            "Worker registered"
        );

        Ok(ticket)
    }

    /// Attach the spawned task to its entry
    ///
    /// If the worker already exited and unregistered, the handle is dropped.
    pub async fn attach(&self, worker_id: u64, task: JoinHandle<()>) {
        let mut workers = self.workers.write().await;
        if let Some(handle) = workers.get_mut(&worker_id) {
            handle.task = Some(task);
        }
    }

    /// Remove a worker, called by the worker itself as it exits
    pub async fn unregister(&self, worker_id: u64) -> Option<WorkerTicket> {
        let mut workers = self.workers.write().await;
        let removed = workers.remove(&worker_id)?;

        tracing::info!(
            worker_id = worker_id,
            process_id = removed.process_id(),
            connected_secs = removed.connected_at.elapsed().as_secs(),
            active = workers.len(),
            "Worker unregistered"
        );

        if workers.is_empty() {
            self.emptied.notify_waiters();
        }
        Some(removed.ticket)
    }

    pub async fn active_count(&self) -> usize {
        self.workers.read().await.len()
    }

    /// OS process ids of every active worker
    pub async fn process_ids(&self) -> Vec<u32> {
        let workers = self.workers.read().await;
        workers.values().map(|w| w.process_id()).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop every worker
    ///
    /// Refuses new registrations, cancels all workers and gives them `grace`
    /// to exit on their own. Whatever is still running afterwards is aborted,
    /// which drops its channel and flow-control handles.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        let cancelled = {
            let workers = self.workers.write().await;
            self.closed.store(true, Ordering::Release);
            for handle in workers.values() {
                handle.ticket.cancel.cancel();
            }
            workers.len()
        };

        if tokio::time::timeout(grace, self.wait_until_empty())
            .await
            .is_err()
        {
            tracing::warn!(
                grace_ms = grace.as_millis() as u64,
                "Workers did not stop within grace period"
            );
        }

        let stragglers: Vec<WorkerHandle> = {
            let mut workers = self.workers.write().await;
            workers.drain().map(|(_, handle)| handle).collect()
        };

        let mut aborted = 0;
        for mut handle in stragglers {
            if let Some(task) = handle.task.take() {
                task.abort();
                let _ = task.await;
            }
            aborted += 1;
            tracing::debug!(worker_id = handle.ticket.worker_id, "Worker aborted");
        }

        ShutdownReport { cancelled, aborted }
    }

    async fn wait_until_empty(&self) {
        loop {
            let notified = self.emptied.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.workers.read().await.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
