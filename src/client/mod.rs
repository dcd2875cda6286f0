//! Trace client
//!
//! Client side of the rendezvous handshake and the framed message stream,
//! for processes that want to send trace lines to a running server.

pub mod config;
pub mod connector;

pub use config::ClientConfig;
pub use connector::{TraceClient, NEGOTIATION_ORDER};
