//! Client configuration

use std::time::Duration;

use crate::protocol::constants::{COMMUNICATION_TIMEOUT, DEFAULT_PIPE_SIZE_KB};
use crate::protocol::{ProtocolGeneration, TextEncoding};

/// Client configuration options
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Protocol generation to use (None = negotiate)
    pub generation: Option<ProtocolGeneration>,

    /// Text encoding of outgoing messages
    pub encoding: TextEncoding,

    /// Timeout for the lock and for each handshake exchange
    pub timeout: Duration,

    /// Buffer size of client-created channels, in KiB
    pub pipe_size_kb: u32,

    /// Ask the server not to auto-clear its log for this connection
    pub ignore_auto_clear: bool,

    /// Thread id stamped on messages built by the client
    pub thread_id: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            generation: None,
            encoding: TextEncoding::Narrow,
            timeout: COMMUNICATION_TIMEOUT,
            pipe_size_kb: DEFAULT_PIPE_SIZE_KB,
            ignore_auto_clear: false,
            thread_id: 1,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use one generation only instead of negotiating
    pub fn generation(mut self, generation: ProtocolGeneration) -> Self {
        self.generation = Some(generation);
        self
    }

    /// Send UTF-16 text
    pub fn wide(mut self) -> Self {
        self.encoding = TextEncoding::Wide;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn pipe_size_kb(mut self, size: u32) -> Self {
        self.pipe_size_kb = size.max(1);
        self
    }

    pub fn ignore_auto_clear(mut self, ignore: bool) -> Self {
        self.ignore_auto_clear = ignore;
        self
    }

    pub fn thread_id(mut self, thread_id: u32) -> Self {
        self.thread_id = thread_id;
        self
    }
}
