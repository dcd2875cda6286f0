//! Trace protocol
//!
//! Two layers:
//! - the rendezvous handshake, negotiated through a 16-byte shared record
//!   ([`handshake`])
//! - the framed message stream carried on each client's private channel
//!   ([`message`])

pub mod constants;
pub mod handshake;
pub mod message;

pub use handshake::{ChannelOwner, ProtocolGeneration, RendezvousRecord, RendezvousRequest};
pub use message::{MessageKind, TextEncoding, Timestamp, TraceRecord, WireHeader, WireMessage};
