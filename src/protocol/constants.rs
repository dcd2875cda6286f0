//! Protocol constants shared by the server and its clients

use std::time::Duration;

/// Protocol version spoken by this server (current generation)
pub const SERVER_VERSION: i32 = 7;

/// Size of the fixed wire message header in bytes
pub const HEADER_SIZE: usize = 48;

/// Size of the rendezvous record in the shared region
pub const RENDEZVOUS_RECORD_SIZE: usize = 16;

/// Bytes represented by one flow-control unit
pub const FLOW_CONTROL_UNIT: usize = 1024;

/// Largest step by which a payload buffer grows while it is being read
pub const PAYLOAD_READ_CHUNK: usize = 64 * 1024;

/// Default channel buffer size and flow-control maximum, in units
pub const DEFAULT_PIPE_SIZE_KB: u32 = 100;

/// Bounded wait used on both sides of the handshake
pub const COMMUNICATION_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default capacity of the intermediate message cache
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

/// Default aggregator tick
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Smallest accepted log retention cap
pub const MIN_LOG_ENTRIES: usize = 100;

/// Largest accepted log retention cap
pub const MAX_LOG_ENTRIES: usize = 1_000_000;

/// Display name used when a process or thread never announced itself
pub const UNKNOWN_NAME: &str = "Unknown";

// Rendezvous status codes, written over the version field once a request
// has been read.
pub const STATUS_FAILURE: i32 = 0;
pub const STATUS_ACCEPTED: i32 = 1;
pub const STATUS_WORKER_STARTED: i32 = 2;
pub const STATUS_HANDLES_TAKEN: i32 = 3;
