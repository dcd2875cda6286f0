//! Per-worker registry entries

use std::time::Instant;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::protocol::ProtocolGeneration;

/// Identity handed to a worker when it is registered
#[derive(Debug, Clone)]
pub struct WorkerTicket {
    /// Registry key, unique for the server's lifetime
    pub worker_id: u64,
    /// OS process id of the client
    pub process_id: u32,
    /// Surrogate id, distinct per accepted connection even if the OS reuses pids
    pub unique_process_id: u32,
    pub generation: ProtocolGeneration,
    /// Cancelled when the worker must stop reading
    pub cancel: CancellationToken,
}

/// Entry for a single worker in the registry
///
/// The task owns the worker, which owns the duplicated channel and
/// flow-control handles; aborting the task releases them.
#[derive(Debug)]
pub struct WorkerHandle {
    pub ticket: WorkerTicket,

    /// Worker task, attached right after spawning
    pub(super) task: Option<JoinHandle<()>>,

    /// When the handshake completed
    pub connected_at: Instant,
}

impl WorkerHandle {
    pub(super) fn new(ticket: WorkerTicket) -> Self {
        Self {
            ticket,
            task: None,
            connected_at: Instant::now(),
        }
    }

    pub fn process_id(&self) -> u32 {
        self.ticket.process_id
    }

    /// Whether the worker task has been attached and is still running
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}
