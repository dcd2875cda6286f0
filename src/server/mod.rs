//! Trace server implementation
//!
//! # Architecture
//!
//! ```text
//!   clients ──► Rendezvous ──► ConnectionBroker ──spawn──► ClientWorker (one per channel)
//!                                    │                          │
//!                                    │ ServerEvent              │ push / ServerEvent
//!                                    ▼                          ▼
//!                              LogAggregator ◄──flush── BoundedMessageCache
//!                                    │
//!                                    ├──► MasterLog
//!                                    └──► TraceDisplay
//! ```
//!
//! The aggregator is the only task that talks to the display.

pub mod aggregator;
pub mod broker;
pub mod config;
pub mod context;
pub mod display;
pub mod listener;
pub mod shared;
pub mod worker;

pub use aggregator::LogAggregator;
pub use broker::{Accepted, ConnectionBroker, RequestOutcome};
pub use config::ServerConfig;
pub use context::ClientContext;
pub use display::{NullDisplay, TraceDisplay};
pub use listener::TraceServer;
pub use shared::{ServerEvent, ServerShared};
pub use worker::{ClientWorker, FlowControlledReader};
