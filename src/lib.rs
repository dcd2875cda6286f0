//! Trace collection server
//!
//! Processes on the same host connect through a named rendezvous, each gets
//! a private flow-controlled channel, and their trace lines are merged into
//! one ordered log.
//!
//! ```text
//!            ┌───────────── rendezvous (lock + 16-byte record) ─────────────┐
//!            │                                                               │
//!  [TraceClient] ──handshake──► ConnectionBroker ──► SessionRegistry         │
//!       │                              │                                     │
//!       │ framed messages              ▼                                     │
//!       └──── channel ────────► ClientWorker ──► BoundedMessageCache         │
//!             ◄── 1 unit/KiB ──        │                 │                   │
//!                                      ▼                 ▼                   │
//!                               Directories      LogAggregator ──► MasterLog │
//!                                                        │                   │
//!                                                        └──► TraceDisplay   │
//!            └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use trace_server::{LocalHost, NullDisplay, ServerConfig, TraceServer};
//!
//! # async fn example() -> trace_server::Result<()> {
//! let host = LocalHost::new();
//! let server = TraceServer::new(ServerConfig::default(), NullDisplay);
//! server
//!     .run_until(host.spawn_process(), host.rendezvous().clone(), async {
//!         tokio::signal::ctrl_c().await.ok();
//!     })
//!     .await
//! # }
//! ```

pub mod client;
pub mod error;
pub mod ipc;
pub mod log;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod stats;

pub use client::{ClientConfig, TraceClient};
pub use error::{Error, Result};
pub use ipc::LocalHost;
pub use server::{NullDisplay, ServerConfig, TraceDisplay, TraceServer};
