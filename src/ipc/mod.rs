//! Host primitives used by the handshake and the workers
//!
//! The broker never touches OS objects directly. It sees three seams:
//!
//! - [`Rendezvous`]: the named lock, the shared 16-byte region and the
//!   "data ready" / "data accepted" signals clients use to reach the server.
//! - [`HandleTable`]: the server process's view of handles, able to duplicate
//!   a client's channel and semaphore or to create a fresh pair to offer.
//! - [`FlowControl`]: the counting semaphore a worker releases as it reads.
//!
//! [`local`] implements all three in-process on top of tokio primitives.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncRead;

use crate::protocol::RendezvousRecord;

pub mod local;

pub use local::{LocalHost, LocalProcess, LocalRendezvous, LocalSemaphore, PipeWriter};

/// Handle value as written into a rendezvous record
pub type HandleId = u32;

/// Writer-side credit, released by the reader in 1 KiB units
pub trait FlowControl: Send + Sync {
    /// Return `units` KiB of credit to the writer
    fn release(&self, units: u32) -> io::Result<()>;
}

impl<F: FlowControl + ?Sized> FlowControl for Arc<F> {
    fn release(&self, units: u32) -> io::Result<()> {
        (**self).release(units)
    }
}

/// A channel and semaphore the server created to offer to a client
pub struct ProvisionedChannel<C, F> {
    /// Read end, kept by the server
    pub reader: C,
    /// Semaphore, kept by the server
    pub flow_control: F,
    /// Write end handle, published for the client to duplicate
    pub write_handle: HandleId,
    /// Semaphore handle, published for the client to duplicate
    pub flow_control_handle: HandleId,
}

/// The server process's handle table
pub trait HandleTable: Send + Sync + 'static {
    type Channel: AsyncRead + Unpin + Send + 'static;
    type FlowControl: FlowControl + 'static;

    /// Id of the process owning this table
    fn process_id(&self) -> u32;

    /// Duplicate a client's channel read end and semaphore into this process
    fn duplicate_from(
        &self,
        process_id: u32,
        channel: HandleId,
        flow_control: HandleId,
    ) -> io::Result<(Self::Channel, Self::FlowControl)>;

    /// Create a channel of `size_kb` KiB and a semaphore counting as many units
    fn create_channel(
        &self,
        size_kb: u32,
    ) -> io::Result<ProvisionedChannel<Self::Channel, Self::FlowControl>>;

    /// Close a handle published in this table
    fn close(&self, handle: HandleId);
}

/// Server side of the named rendezvous objects
pub trait Rendezvous: Send + Sync + 'static {
    /// Start admitting clients to the shared region
    fn open(&self);

    /// Stop admitting clients
    fn close(&self);

    /// Current content of the shared region
    fn read(&self) -> RendezvousRecord;

    /// Overwrite the shared region
    fn write(&self, record: &RendezvousRecord);

    /// Wait for "data ready", forever if `timeout` is None
    ///
    /// Resolves to false if the timeout elapsed first.
    fn wait_ready(&self, timeout: Option<Duration>) -> impl Future<Output = bool> + Send;

    /// Signal "data accepted" to the client currently holding the lock
    fn accept(&self);
}
