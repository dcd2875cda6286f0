//! Error types
//!
//! Errors are grouped by the stage that produced them. Handshake errors fail a
//! single connection attempt, decode errors end a single worker, and only
//! `LowMemory` is escalated to the whole server.

use std::fmt;
use std::io;

pub use crate::registry::RegistryError;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug)]
pub enum Error {
    /// Generic I/O failure
    Io(io::Error),
    /// Connection handshake failed
    Handshake(HandshakeError),
    /// Wire message could not be decoded
    Decode(DecodeError),
    /// Worker registry rejected the operation
    Registry(RegistryError),
    /// Releasing flow-control units failed
    FlowControl(io::Error),
    /// Reading from a client channel failed for a reason other than closure
    ChannelRead(io::Error),
    /// Allocation failure in the decode path
    LowMemory,
}

impl Error {
    /// Whether this error only means the peer went away
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::Io(e) | Error::ChannelRead(e) => is_closed_channel(e),
            _ => false,
        }
    }
}

/// Error codes produced when a peer closes its end of a channel
pub(crate) fn is_closed_channel(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    )
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Handshake(e) => write!(f, "Handshake error: {}", e),
            Error::Decode(e) => write!(f, "Decode error: {}", e),
            Error::Registry(e) => write!(f, "Registry error: {}", e),
            Error::FlowControl(e) => write!(f, "Invalid state of channel semaphore: {}", e),
            Error::ChannelRead(e) => write!(f, "Error while reading client channel: {}", e),
            Error::LowMemory => write!(f, "Low memory"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) | Error::FlowControl(e) | Error::ChannelRead(e) => Some(e),
            Error::Handshake(e) => Some(e),
            Error::Decode(e) => Some(e),
            Error::Registry(e) => Some(e),
            Error::LowMemory => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<HandshakeError> for Error {
    fn from(err: HandshakeError) -> Self {
        Error::Handshake(err)
    }
}

impl From<DecodeError> for Error {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::OutOfMemory { .. } => Error::LowMemory,
            other => Error::Decode(other),
        }
    }
}

impl From<RegistryError> for Error {
    fn from(err: RegistryError) -> Self {
        Error::Registry(err)
    }
}

/// Handshake errors
#[derive(Debug)]
pub enum HandshakeError {
    /// Client requested a protocol generation this server does not speak
    UnsupportedVersion { version: i32, process_id: u32 },
    /// Could not duplicate the client's handles into this process
    DuplicateHandle { process_id: u32, source: io::Error },
    /// Could not create the channel or its flow-control semaphore
    CreateChannel(io::Error),
    /// Peer did not confirm within the communication timeout
    ConfirmationTimeout,
    /// Peer answered with a failure status
    ConfirmationRejected { status: i32 },
    /// The confirmation came from a process other than the one offered the channel
    ConfirmationMismatch { expected: u32, received: u32 },
    /// The client released the rendezvous before confirming; another request took its place
    Abandoned { process_id: u32 },
    /// The worker could not be started
    WorkerStart(RegistryError),
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::UnsupportedVersion {
                version,
                process_id,
            } => write!(
                f,
                "Incorrect version of client, connection refused (client PID: {}, client version: {}, server version: {})",
                process_id,
                version,
                crate::protocol::constants::SERVER_VERSION
            ),
            HandshakeError::DuplicateHandle { process_id, source } => write!(
                f,
                "Unable to duplicate handles of process {}: {}",
                process_id, source
            ),
            HandshakeError::CreateChannel(e) => write!(f, "Unable to create channel: {}", e),
            HandshakeError::ConfirmationTimeout => {
                write!(f, "Client did not confirm the offered channel in time")
            }
            HandshakeError::ConfirmationRejected { status } => {
                write!(f, "Client rejected the offered channel (status {})", status)
            }
            HandshakeError::ConfirmationMismatch { expected, received } => write!(
                f,
                "Channel offered to process {} was confirmed by process {}",
                expected, received
            ),
            HandshakeError::Abandoned { process_id } => write!(
                f,
                "Process {} abandoned the handshake before taking the channel",
                process_id
            ),
            HandshakeError::WorkerStart(e) => {
                write!(f, "Unable to start client worker, connection failed: {}", e)
            }
        }
    }
}

impl std::error::Error for HandshakeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HandshakeError::DuplicateHandle { source, .. } => Some(source),
            HandshakeError::CreateChannel(e) => Some(e),
            HandshakeError::WorkerStart(e) => Some(e),
            _ => None,
        }
    }
}

/// Wire decoding errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Message kind outside the known set
    UnknownMessageKind(i32),
    /// Payload does not match its header
    MalformedPayload(&'static str),
    /// Payload buffer could not be allocated
    OutOfMemory { requested: usize },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::UnknownMessageKind(kind) => {
                write!(f, "Unknown message type {}, connection failed", kind)
            }
            DecodeError::MalformedPayload(reason) => write!(f, "Malformed payload: {}", reason),
            DecodeError::OutOfMemory { requested } => {
                write!(f, "Unable to allocate {} bytes for payload", requested)
            }
        }
    }
}

impl std::error::Error for DecodeError {}
