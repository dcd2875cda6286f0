//! Registry of active client workers
//!
//! Every accepted handshake produces one worker. The registry tracks them so
//! the broker can tell first-time processes from reconnects and so shutdown
//! can reach every worker.
//!
//! ```text
//!                       Arc<SessionRegistry>
//!                  ┌───────────────────────────┐
//!                  │ workers: HashMap<id,       │
//!                  │   WorkerHandle {           │
//!                  │     process_id,            │
//!                  │     cancel, task,          │
//!                  │   }                        │
//!                  │ >                          │
//!                  └─────────────┬─────────────┘
//!                                │
//!         ┌──────────────────────┼──────────────────────┐
//!         │                      │                      │
//!         ▼                      ▼                      ▼
//!  [ConnectionBroker]      [ClientWorker]          [TraceServer]
//!   is_new_process()        unregister()            shutdown()
//!   register()/attach()     on exit                 cancel, wait, abort
//! ```

pub mod entry;
pub mod error;
pub mod store;

pub use entry::{WorkerHandle, WorkerTicket};
pub use error::RegistryError;
pub use store::{SessionRegistry, ShutdownReport};
