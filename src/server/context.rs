//! Client context
//!
//! Identity of a connected client, passed to display callbacks.

use crate::protocol::ProtocolGeneration;
use crate::registry::WorkerTicket;

/// Read-only description of one accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientContext {
    /// Registry key of the worker serving the connection
    pub worker_id: u64,

    /// OS process id of the client
    pub process_id: u32,

    /// Surrogate id, stable for the connection's lifetime
    pub unique_process_id: u32,

    /// Protocol generation negotiated in the handshake
    pub generation: ProtocolGeneration,
}

impl From<&WorkerTicket> for ClientContext {
    fn from(ticket: &WorkerTicket) -> Self {
        Self {
            worker_id: ticket.worker_id,
            process_id: ticket.process_id,
            unique_process_id: ticket.unique_process_id,
            generation: ticket.generation,
        }
    }
}
