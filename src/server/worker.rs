//! Client worker
//!
//! One task per accepted connection. It reads framed messages off the
//! client's channel, returns flow-control credit as bytes are consumed, and
//! routes each message:
//!
//! ```text
//! SetProcessName ──► directories.processes  ──► ProcessesChanged
//! SetThreadName  ──► directories.threads    ──► ThreadsChanged
//! Information    ──┐
//! Error          ──┴► cache.push (waits while the cache is full)
//! IgnoreAutoClear ──► ProcessConnected, if this process is new and the
//!                     flag is clear
//! ```
//!
//! The worker ends when the channel closes, when a message cannot be decoded,
//! or when its cancellation token fires.

use std::io;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{DecodeError, Error, Result};
use crate::ipc::FlowControl;
use crate::log::{EntryKind, LogEntry};
use crate::protocol::constants::{FLOW_CONTROL_UNIT, HEADER_SIZE, PAYLOAD_READ_CHUNK};
use crate::protocol::{WireHeader, WireMessage};
use crate::registry::WorkerTicket;
use crate::stats::WorkerStats;

use super::context::ClientContext;
use super::shared::{ServerEvent, ServerShared};

/// Channel reader that returns one flow-control unit per KiB consumed
///
/// Bytes are counted per read; remainders below a full unit carry over to the
/// next read, so after `n` bytes exactly `n / 1024` units have been released.
pub struct FlowControlledReader<R, F> {
    inner: R,
    flow_control: F,
    unreleased: usize,
    report_errors: bool,
    error_reported: bool,
    pending_error: Option<io::Error>,
    bytes_read: u64,
    units_released: u64,
}

impl<R, F> FlowControlledReader<R, F>
where
    R: AsyncRead + Unpin,
    F: FlowControl,
{
    /// Wrap a channel; release failures are surfaced only if `report_errors`
    pub fn new(inner: R, flow_control: F, report_errors: bool) -> Self {
        Self {
            inner,
            flow_control,
            unreleased: 0,
            report_errors,
            error_reported: false,
            pending_error: None,
            bytes_read: 0,
            units_released: 0,
        }
    }

    /// Fill `buf` completely
    ///
    /// End of stream before `buf` is full is reported as a closed channel.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self
                .inner
                .read(&mut buf[filled..])
                .await
                .map_err(Error::ChannelRead)?;
            if n == 0 {
                return Err(Error::ChannelRead(io::ErrorKind::UnexpectedEof.into()));
            }
            filled += n;
            self.account(n);
        }
        Ok(())
    }

    /// Read a `len` byte payload, growing the buffer only as data arrives
    ///
    /// A header announcing more than the client ever sends costs at most one
    /// chunk beyond the bytes actually received.
    pub async fn read_payload(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        while payload.len() < len {
            let start = payload.len();
            let step = (len - start).min(PAYLOAD_READ_CHUNK);
            payload
                .try_reserve(step)
                .map_err(|_| DecodeError::OutOfMemory { requested: len })?;
            payload.resize(start + step, 0);
            self.read_exact(&mut payload[start..]).await?;
        }
        Ok(payload)
    }

    fn account(&mut self, n: usize) {
        self.bytes_read += n as u64;
        self.unreleased += n;

        let units = self.unreleased / FLOW_CONTROL_UNIT;
        if units == 0 {
            return;
        }
        match self.flow_control.release(units as u32) {
            Ok(()) => {
                self.unreleased %= FLOW_CONTROL_UNIT;
                self.units_released += units as u64;
            }
            Err(e) => {
                tracing::debug!(units = units, error = %e, "Flow-control release failed");
                if self.report_errors && !self.error_reported {
                    self.error_reported = true;
                    self.pending_error = Some(e);
                }
            }
        }
    }

    /// Release failure not yet surfaced, at most one per channel
    pub fn take_flow_error(&mut self) -> Option<Error> {
        self.pending_error.take().map(Error::FlowControl)
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn units_released(&self) -> u64 {
        self.units_released
    }
}

/// Reader of one client's channel
pub struct ClientWorker<R, F> {
    shared: Arc<ServerShared>,
    ticket: WorkerTicket,
    reader: FlowControlledReader<R, F>,
    /// Raise "process connected" when the client clears `IgnoreAutoClear`
    announce_connect: bool,
    stats: WorkerStats,
}

impl<R, F> ClientWorker<R, F>
where
    R: AsyncRead + Unpin + Send,
    F: FlowControl,
{
    pub fn new(
        shared: Arc<ServerShared>,
        ticket: WorkerTicket,
        channel: R,
        flow_control: F,
        announce_connect: bool,
    ) -> Self {
        let report_errors = ticket.generation.reports_flow_control_errors();
        Self {
            shared,
            ticket,
            reader: FlowControlledReader::new(channel, flow_control, report_errors),
            announce_connect,
            stats: WorkerStats::new(),
        }
    }

    /// Read until the channel closes or the worker is cancelled
    ///
    /// Always unregisters the worker and posts a disconnect on the way out.
    pub async fn run(mut self) {
        let started = Instant::now();
        let client = ClientContext::from(&self.ticket);
        let cancel = self.ticket.cancel.clone();

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(worker_id = client.worker_id, "Worker cancelled");
                Ok(())
            }
            result = self.process_messages() => result,
        };

        if let Some(err) = self.reader.take_flow_error() {
            self.shared.post(ServerEvent::Failure(err));
        }
        match outcome {
            Ok(()) => {}
            Err(e) if e.is_disconnect() => {
                tracing::debug!(
                    worker_id = client.worker_id,
                    process_id = client.process_id,
                    "Client closed channel"
                );
            }
            Err(e) => {
                tracing::warn!(
                    worker_id = client.worker_id,
                    process_id = client.process_id,
                    error = %e,
                    "Worker failed"
                );
                self.shared.post(ServerEvent::Failure(e));
            }
        }

        self.stats.bytes_read = self.reader.bytes_read();
        self.stats.flow_units_released = self.reader.units_released();
        self.stats.duration = started.elapsed();
        self.shared.stats.record_worker(&self.stats);

        tracing::debug!(
            worker_id = client.worker_id,
            bytes = self.stats.bytes_read,
            messages = self.stats.messages,
            lines = self.stats.trace_lines,
            "Worker finished"
        );

        self.shared.registry.unregister(client.worker_id).await;
        self.shared.post(ServerEvent::ProcessDisconnected(client));
    }

    async fn process_messages(&mut self) -> Result<()> {
        let mut raw_header = [0u8; HEADER_SIZE];
        loop {
            self.reader.read_exact(&mut raw_header).await?;
            let header = WireHeader::decode(&raw_header);
            let len = header.payload_len()?;

            let payload = self.reader.read_payload(len).await?;

            let message = WireMessage::decode(&header, &payload)?;
            self.stats.messages += 1;
            self.handle_message(message).await;

            if let Some(err) = self.reader.take_flow_error() {
                self.shared.post(ServerEvent::Failure(err));
            }
        }
    }

    async fn handle_message(&mut self, message: WireMessage) {
        let unique_process_id = self.ticket.unique_process_id;

        match message {
            WireMessage::SetProcessName { name } => {
                tracing::trace!(unique_process_id, name = %name, "Process name set");
                self.shared.directories.processes.set(unique_process_id, name);
                self.shared.post(ServerEvent::ProcessesChanged);
            }
            WireMessage::SetThreadName {
                unique_thread_id,
                name,
            } => {
                self.shared
                    .directories
                    .threads
                    .set((unique_process_id, unique_thread_id), name);
                self.shared.post(ServerEvent::ThreadsChanged);
            }
            WireMessage::Information(record) => self.push(EntryKind::Info, record).await,
            WireMessage::Error(record) => self.push(EntryKind::Error, record).await,
            WireMessage::IgnoreAutoClear { ignore } => {
                if self.announce_connect && !ignore {
                    self.announce_connect = false;
                    self.shared
                        .post(ServerEvent::ProcessConnected(ClientContext::from(&self.ticket)));
                }
            }
        }
    }

    async fn push(&mut self, kind: EntryKind, record: crate::protocol::TraceRecord) {
        let entry = LogEntry::from_record(
            self.ticket.process_id,
            self.ticket.unique_process_id,
            kind,
            record,
        );
        self.shared.cache.push(entry).await;
        self.stats.trace_lines += 1;
    }
}
