//! Rendezvous handshake
//!
//! A client and the server agree on a private channel by exchanging a
//! 16-byte record through a shared region, guarded by a named lock:
//!
//! ```text
//! Client (holds lock)                         Server
//!   |                                           |
//!   |-- record {version, pid, handles} -------->|  "data ready"
//!   |                                           |
//!   |   client creates channel (gen 4, 6):      |
//!   |<------------- status 1 / 0 ---------------|  "data accepted"
//!   |                                           |
//!   |   server creates channel (gen 5, 7):      |
//!   |<-- {1, server pid, write end, semaphore} -|  "data accepted"
//!   |-- {3, client pid} ----------------------->|  "data ready"
//!   |<------------- status 2 / 0 ---------------|  "data accepted"
//! ```
//!
//! Which side creates the channel flipped between protocol generations, so
//! the server keeps one strategy per generation instead of branching on raw
//! version numbers.

use bytes::{Buf, BufMut};

use super::constants::{
    RENDEZVOUS_RECORD_SIZE, SERVER_VERSION, STATUS_ACCEPTED, STATUS_FAILURE,
    STATUS_HANDLES_TAKEN, STATUS_WORKER_STARTED,
};

/// Side responsible for creating the channel and its semaphore
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOwner {
    /// Client pre-creates both, the server duplicates them out of the client
    Client,
    /// Server creates both and offers them to the client
    Server,
}

/// The four protocol generations the server accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolGeneration {
    /// Old client, client-created channel, no auto-clear control message
    LegacyClientChannel,
    /// Old client, server-created channel, no auto-clear control message
    LegacyServerChannel,
    /// Current client, client-created channel
    ClientChannel,
    /// Current client, server-created channel
    ServerChannel,
}

impl ProtocolGeneration {
    /// All supported generations, oldest first
    pub const ALL: [ProtocolGeneration; 4] = [
        ProtocolGeneration::LegacyClientChannel,
        ProtocolGeneration::LegacyServerChannel,
        ProtocolGeneration::ClientChannel,
        ProtocolGeneration::ServerChannel,
    ];

    /// Map a requested version number to a generation
    pub fn from_version(version: i32) -> Option<Self> {
        match SERVER_VERSION - version {
            3 => Some(ProtocolGeneration::LegacyClientChannel),
            2 => Some(ProtocolGeneration::LegacyServerChannel),
            1 => Some(ProtocolGeneration::ClientChannel),
            0 => Some(ProtocolGeneration::ServerChannel),
            _ => None,
        }
    }

    /// Version number written into the rendezvous record
    pub fn version(self) -> i32 {
        match self {
            ProtocolGeneration::LegacyClientChannel => SERVER_VERSION - 3,
            ProtocolGeneration::LegacyServerChannel => SERVER_VERSION - 2,
            ProtocolGeneration::ClientChannel => SERVER_VERSION - 1,
            ProtocolGeneration::ServerChannel => SERVER_VERSION,
        }
    }

    /// Who creates the channel in this generation
    pub fn channel_owner(self) -> ChannelOwner {
        match self {
            ProtocolGeneration::LegacyClientChannel | ProtocolGeneration::ClientChannel => {
                ChannelOwner::Client
            }
            ProtocolGeneration::LegacyServerChannel | ProtocolGeneration::ServerChannel => {
                ChannelOwner::Server
            }
        }
    }

    /// Whether clients of this generation send `IgnoreAutoClear` after connecting
    ///
    /// Legacy clients never do, so the server raises "process connected" for
    /// them as soon as the worker starts.
    pub fn announces_auto_clear(self) -> bool {
        matches!(
            self,
            ProtocolGeneration::ClientChannel | ProtocolGeneration::ServerChannel
        )
    }

    /// Whether flow-control release failures are worth reporting
    ///
    /// Legacy clients mismanage the semaphore count, so failures are expected.
    pub fn reports_flow_control_errors(self) -> bool {
        self.announces_auto_clear()
    }
}

impl std::fmt::Display for ProtocolGeneration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let owner = match self.channel_owner() {
            ChannelOwner::Client => "client-created",
            ChannelOwner::Server => "server-created",
        };
        write!(f, "v{} ({})", self.version(), owner)
    }
}

/// Content of the shared rendezvous region
///
/// The first field is a version number in a request and a status code in
/// every later exchange of the same handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RendezvousRecord {
    /// Requested version or status code
    pub version: i32,
    /// Process id of whichever side wrote the record last
    pub process_id: u32,
    /// Channel end handle, valid in `process_id`
    pub channel: u32,
    /// Flow-control semaphore handle, valid in `process_id`
    pub flow_control: u32,
}

impl RendezvousRecord {
    /// Build a connection request
    pub fn request(generation: ProtocolGeneration, process_id: u32) -> Self {
        Self {
            version: generation.version(),
            process_id,
            channel: 0,
            flow_control: 0,
        }
    }

    /// Build a status-only record
    pub fn status(status: i32) -> Self {
        Self {
            version: status,
            ..Default::default()
        }
    }

    /// Decode from the shared region
    pub fn decode(mut buf: &[u8]) -> Option<Self> {
        if buf.remaining() < RENDEZVOUS_RECORD_SIZE {
            return None;
        }
        Some(Self {
            version: buf.get_i32_le(),
            process_id: buf.get_u32_le(),
            channel: buf.get_u32_le(),
            flow_control: buf.get_u32_le(),
        })
    }

    /// Encode into the shared region
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i32_le(self.version);
        buf.put_u32_le(self.process_id);
        buf.put_u32_le(self.channel);
        buf.put_u32_le(self.flow_control);
    }

    /// Encode into a fixed-size array
    pub fn to_bytes(&self) -> [u8; RENDEZVOUS_RECORD_SIZE] {
        let mut out = [0u8; RENDEZVOUS_RECORD_SIZE];
        self.encode(&mut &mut out[..]);
        out
    }
}

/// How the server interprets a record it was woken for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendezvousRequest {
    /// A connection request in a supported generation
    Connect(ProtocolGeneration),
    /// A leftover status code from an abandoned handshake
    Stale(i32),
    /// A version this server does not speak
    Unsupported(i32),
}

impl RendezvousRequest {
    /// Classify the version field of a freshly signalled record
    pub fn classify(version: i32) -> Self {
        if let Some(generation) = ProtocolGeneration::from_version(version) {
            return RendezvousRequest::Connect(generation);
        }
        match version {
            STATUS_FAILURE | STATUS_ACCEPTED | STATUS_WORKER_STARTED | STATUS_HANDLES_TAKEN => {
                RendezvousRequest::Stale(version)
            }
            other => RendezvousRequest::Unsupported(other),
        }
    }
}
