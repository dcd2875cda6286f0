//! Client connector
//!
//! Performs the client half of the handshake against an in-process host and
//! then writes framed messages, taking one semaphore unit per KiB written.

use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;

use crate::error::{Error, HandshakeError, Result};
use crate::ipc::{LocalHost, LocalProcess, LocalRendezvous, LocalSemaphore, PipeWriter};
use crate::protocol::constants::{
    FLOW_CONTROL_UNIT, STATUS_ACCEPTED, STATUS_FAILURE, STATUS_HANDLES_TAKEN,
    STATUS_WORKER_STARTED,
};
use crate::protocol::{
    ChannelOwner, ProtocolGeneration, RendezvousRecord, Timestamp, TraceRecord, WireMessage,
};

use super::config::ClientConfig;

/// Order in which generations are tried when negotiating
pub const NEGOTIATION_ORDER: [ProtocolGeneration; 4] = [
    ProtocolGeneration::ClientChannel,
    ProtocolGeneration::ServerChannel,
    ProtocolGeneration::LegacyClientChannel,
    ProtocolGeneration::LegacyServerChannel,
];

/// A connected trace client
///
/// # Example
/// ```no_run
/// use trace_server::client::{ClientConfig, TraceClient};
/// use trace_server::ipc::LocalHost;
///
/// # async fn example() -> trace_server::error::Result<()> {
/// let host = LocalHost::new();
/// let process = host.spawn_process();
/// let mut client = TraceClient::connect(&host, process, ClientConfig::default()).await?;
///
/// client.set_process_name("worker").await?;
/// let record = client.record("main.rs", 42, "hello");
/// client.information(record).await?;
/// # Ok(())
/// # }
/// ```
pub struct TraceClient {
    process: Arc<LocalProcess>,
    writer: PipeWriter,
    flow_control: Arc<LocalSemaphore>,
    generation: ProtocolGeneration,
    config: ClientConfig,
    /// Bytes that may still be written without taking another unit
    credit: usize,
    buf: BytesMut,
}

impl TraceClient {
    /// Connect `process` to the server running on `host`
    ///
    /// Uses `config.generation` if set, otherwise tries each generation in
    /// [`NEGOTIATION_ORDER`] until one succeeds.
    pub async fn connect(
        host: &Arc<LocalHost>,
        process: Arc<LocalProcess>,
        config: ClientConfig,
    ) -> Result<Self> {
        let (generation, writer, flow_control) = {
            let rendezvous = host.rendezvous();
            let _lock = rendezvous.acquire(config.timeout).await?;
            negotiate(rendezvous, &process, &config).await?
        };

        tracing::debug!(
            process_id = process.id(),
            generation = %generation,
            "Connected to trace server"
        );

        let mut client = Self {
            process,
            writer,
            flow_control,
            generation,
            config,
            credit: 0,
            buf: BytesMut::with_capacity(256),
        };
        if generation.announces_auto_clear() {
            let ignore = client.config.ignore_auto_clear;
            client
                .send(&WireMessage::IgnoreAutoClear { ignore })
                .await?;
        }
        Ok(client)
    }

    pub fn generation(&self) -> ProtocolGeneration {
        self.generation
    }

    pub fn process_id(&self) -> u32 {
        self.process.id()
    }

    /// Build a record stamped with the current time and this client's thread
    pub fn record(&self, source_file: &str, source_line: u32, text: &str) -> TraceRecord {
        TraceRecord {
            thread_id: self.config.thread_id,
            unique_thread_id: self.config.thread_id,
            timestamp: Timestamp::now(),
            counter: 0.0,
            source_line,
            source_file: source_file.to_string(),
            text: text.to_string(),
        }
    }

    pub async fn set_process_name(&mut self, name: &str) -> Result<()> {
        self.send(&WireMessage::SetProcessName {
            name: name.to_string(),
        })
        .await
    }

    pub async fn set_thread_name(&mut self, unique_thread_id: u32, name: &str) -> Result<()> {
        self.send(&WireMessage::SetThreadName {
            unique_thread_id,
            name: name.to_string(),
        })
        .await
    }

    pub async fn information(&mut self, record: TraceRecord) -> Result<()> {
        self.send(&WireMessage::Information(record)).await
    }

    pub async fn error(&mut self, record: TraceRecord) -> Result<()> {
        self.send(&WireMessage::Error(record)).await
    }

    /// Encode and write one message
    pub async fn send(&mut self, message: &WireMessage) -> Result<()> {
        self.buf.clear();
        message.encode(self.config.encoding, self.config.thread_id, &mut self.buf);
        let frame = self.buf.split().freeze();
        self.write_raw(&frame).await
    }

    /// Write bytes to the channel under flow control
    ///
    /// Waits up to the configured timeout for each unit of credit.
    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        for chunk in bytes.chunks(FLOW_CONTROL_UNIT) {
            while self.credit < chunk.len() {
                match tokio::time::timeout(self.config.timeout, self.flow_control.acquire()).await
                {
                    Ok(acquired) => acquired?,
                    Err(_) => {
                        return Err(Error::Io(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "server stopped consuming the channel",
                        )))
                    }
                }
                self.credit += FLOW_CONTROL_UNIT;
            }
            writer.write_all(chunk).await?;
            self.credit -= chunk.len();
        }
        writer.flush().await?;
        Ok(())
    }

    /// Close the channel; the server sees end of stream
    ///
    /// Shuts the write end down even if another handle to it is still open.
    pub async fn disconnect(self) -> Result<()> {
        tracing::debug!(process_id = self.process.id(), "Disconnecting");
        self.writer.lock().await.shutdown().await?;
        Ok(())
    }
}

async fn negotiate(
    rendezvous: &LocalRendezvous,
    process: &LocalProcess,
    config: &ClientConfig,
) -> Result<(ProtocolGeneration, PipeWriter, Arc<LocalSemaphore>)> {
    let candidates: &[ProtocolGeneration] = match &config.generation {
        Some(generation) => std::slice::from_ref(generation),
        None => &NEGOTIATION_ORDER,
    };

    let mut last_error = None;
    for &generation in candidates {
        match handshake(rendezvous, process, generation, config).await {
            Ok((writer, flow_control)) => return Ok((generation, writer, flow_control)),
            Err(e) => {
                tracing::debug!(generation = %generation, error = %e, "Handshake attempt failed");
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or(Error::Handshake(HandshakeError::ConfirmationTimeout)))
}

async fn handshake(
    rendezvous: &LocalRendezvous,
    process: &LocalProcess,
    generation: ProtocolGeneration,
    config: &ClientConfig,
) -> Result<(PipeWriter, Arc<LocalSemaphore>)> {
    match generation.channel_owner() {
        ChannelOwner::Client => {
            let (read_handle, writer) = process.create_pipe(config.pipe_size_kb);
            let (flow_handle, flow_control) =
                process.create_semaphore(config.pipe_size_kb, config.pipe_size_kb);
            let request = RendezvousRecord {
                version: generation.version(),
                process_id: process.id(),
                channel: read_handle,
                flow_control: flow_handle,
            };

            let reply = rendezvous.transact(request, config.timeout).await;
            process.close_handle(read_handle);
            process.close_handle(flow_handle);

            let reply = reply?;
            if reply.version != STATUS_ACCEPTED {
                return Err(HandshakeError::ConfirmationRejected {
                    status: reply.version,
                }
                .into());
            }
            Ok((writer, flow_control))
        }
        ChannelOwner::Server => {
            let request = RendezvousRecord::request(generation, process.id());
            let offer = rendezvous.transact(request, config.timeout).await?;
            if offer.version != STATUS_ACCEPTED {
                return Err(HandshakeError::ConfirmationRejected {
                    status: offer.version,
                }
                .into());
            }

            let taken = process
                .duplicate_writer(offer.process_id, offer.channel)
                .and_then(|writer| {
                    let flow_control =
                        process.duplicate_semaphore(offer.process_id, offer.flow_control)?;
                    Ok((writer, flow_control))
                });
            let answer = match &taken {
                Ok(_) => RendezvousRecord {
                    version: STATUS_HANDLES_TAKEN,
                    process_id: process.id(),
                    ..Default::default()
                },
                Err(_) => RendezvousRecord::status(STATUS_FAILURE),
            };

            let verdict = rendezvous.transact(answer, config.timeout).await?;
            let (writer, flow_control) =
                taken.map_err(|source| HandshakeError::DuplicateHandle {
                    process_id: offer.process_id,
                    source,
                })?;
            if verdict.version != STATUS_WORKER_STARTED {
                return Err(HandshakeError::ConfirmationRejected {
                    status: verdict.version,
                }
                .into());
            }
            Ok((writer, flow_control))
        }
    }
}
