//! Connection broker
//!
//! Serves the rendezvous one client at a time. Each "data ready" is one
//! request; the broker classifies it by version, runs the matching
//! generation's strategy, starts a worker on success, and signals "data
//! accepted" exactly once when the request is settled. Nothing a single
//! client does can stop the broker.
//!
//! ```text
//! client-created (v4, v6)          server-created (v5, v7)
//!
//!  request ──► duplicate            request ──► create channel
//!              start worker                     offer {1, pid, handles} ─► accept
//!  {1 | 0} ◄── accept               confirm {3, pid} ──► start worker
//!                                   {2 | 0} ◄── accept
//! ```
//!
//! A server-created handshake whose client disappears before confirming is
//! abandoned when the next client's request shows up in the region, and that
//! request is served in its place.

use std::ops::ControlFlow;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::{Error, HandshakeError};
use crate::ipc::{HandleTable, Rendezvous};
use crate::protocol::constants::{
    STATUS_ACCEPTED, STATUS_FAILURE, STATUS_HANDLES_TAKEN, STATUS_WORKER_STARTED,
};
use crate::protocol::{ChannelOwner, ProtocolGeneration, RendezvousRecord, RendezvousRequest};

use super::context::ClientContext;
use super::shared::{ServerEvent, ServerShared};
use super::worker::ClientWorker;

/// A completed handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accepted {
    pub client: ClientContext,
    /// No other active worker served this process when it connected
    pub new_process: bool,
}

/// How a single rendezvous request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Accepted(Accepted),
    /// The handshake failed; the error was posted for the display
    Failed,
    /// A status record arrived where a request was expected; it was refused
    Stale,
}

/// How an offered server channel was settled
enum OfferOutcome {
    Settled(Result<Accepted, HandshakeError>),
    /// The offered client is gone and this request arrived in its place
    Superseded(RendezvousRecord),
}

/// Signals "data accepted" when dropped, settling the request on every path
struct AcceptGuard<'a, R: Rendezvous> {
    rendezvous: &'a R,
    armed: bool,
}

impl<'a, R: Rendezvous> AcceptGuard<'a, R> {
    fn new(rendezvous: &'a R) -> Self {
        Self {
            rendezvous,
            armed: true,
        }
    }

    /// Nobody is waiting for this acknowledgement any more
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<R: Rendezvous> Drop for AcceptGuard<'_, R> {
    fn drop(&mut self) {
        if self.armed {
            self.rendezvous.accept();
        }
    }
}

/// Handshake server
pub struct ConnectionBroker<H: HandleTable, R: Rendezvous> {
    shared: Arc<ServerShared>,
    handles: Arc<H>,
    rendezvous: Arc<R>,
}

impl<H: HandleTable, R: Rendezvous> ConnectionBroker<H, R> {
    pub fn new(shared: Arc<ServerShared>, handles: Arc<H>, rendezvous: Arc<R>) -> Self {
        Self {
            shared,
            handles,
            rendezvous,
        }
    }

    /// Serve requests until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        self.rendezvous.open();
        tracing::info!(
            process_id = self.handles.process_id(),
            "Accepting trace clients"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                ready = self.rendezvous.wait_ready(None) => {
                    if ready {
                        self.serve_request().await;
                    }
                }
            }
        }

        self.rendezvous.close();
        tracing::info!("Stopped accepting trace clients");
    }

    /// Handle the record currently in the shared region
    pub async fn serve_request(&self) -> RequestOutcome {
        let mut request = self.rendezvous.read();
        loop {
            match self.serve_record(request).await {
                ControlFlow::Break(outcome) => return outcome,
                ControlFlow::Continue(next) => request = next,
            }
        }
    }

    async fn serve_record(
        &self,
        request: RendezvousRecord,
    ) -> ControlFlow<RequestOutcome, RendezvousRecord> {
        let generation = match RendezvousRequest::classify(request.version) {
            RendezvousRequest::Connect(generation) => generation,
            RendezvousRequest::Stale(status) => {
                let _accept = AcceptGuard::new(&*self.rendezvous);
                tracing::warn!(
                    status = status,
                    process_id = request.process_id,
                    "Refusing stale rendezvous record"
                );
                self.rendezvous
                    .write(&RendezvousRecord::status(STATUS_FAILURE));
                self.shared.stats.record_stale_request();
                return ControlFlow::Break(RequestOutcome::Stale);
            }
            RendezvousRequest::Unsupported(version) => {
                let _accept = AcceptGuard::new(&*self.rendezvous);
                self.rendezvous
                    .write(&RendezvousRecord::status(STATUS_FAILURE));
                self.report_failure(HandshakeError::UnsupportedVersion {
                    version,
                    process_id: request.process_id,
                });
                return ControlFlow::Break(RequestOutcome::Failed);
            }
        };

        tracing::debug!(
            process_id = request.process_id,
            generation = %generation,
            "Connection request"
        );

        let accept = AcceptGuard::new(&*self.rendezvous);
        let result = match generation.channel_owner() {
            ChannelOwner::Client => self.accept_client_channel(generation, request).await,
            ChannelOwner::Server => match self.offer_server_channel(generation, request).await {
                OfferOutcome::Settled(result) => result,
                OfferOutcome::Superseded(next) => {
                    accept.disarm();
                    self.report_failure(HandshakeError::Abandoned {
                        process_id: request.process_id,
                    });
                    return ControlFlow::Continue(next);
                }
            },
        };

        let outcome = match result {
            Ok(accepted) => {
                self.shared.stats.record_handshake(true);
                tracing::info!(
                    process_id = accepted.client.process_id,
                    unique_process_id = accepted.client.unique_process_id,
                    generation = %generation,
                    new_process = accepted.new_process,
                    "Client connected"
                );
                RequestOutcome::Accepted(accepted)
            }
            Err(err) => {
                self.report_failure(err);
                RequestOutcome::Failed
            }
        };
        drop(accept);
        ControlFlow::Break(outcome)
    }

    /// Client created the channel: duplicate it and answer with a status
    async fn accept_client_channel(
        &self,
        generation: ProtocolGeneration,
        request: RendezvousRecord,
    ) -> Result<Accepted, HandshakeError> {
        let duplicated = self.handles.duplicate_from(
            request.process_id,
            request.channel,
            request.flow_control,
        );
        let result = match duplicated {
            Ok((channel, flow_control)) => {
                self.start_worker(generation, request.process_id, channel, flow_control)
                    .await
            }
            Err(source) => Err(HandshakeError::DuplicateHandle {
                process_id: request.process_id,
                source,
            }),
        };

        let status = if result.is_ok() {
            STATUS_ACCEPTED
        } else {
            STATUS_FAILURE
        };
        self.rendezvous.write(&RendezvousRecord::status(status));
        result
    }

    /// Server creates the channel: offer it, wait for the client to take it
    ///
    /// The offer gets its own "data accepted"; the caller sends the final one
    /// once the settled status is written.
    async fn offer_server_channel(
        &self,
        generation: ProtocolGeneration,
        request: RendezvousRecord,
    ) -> OfferOutcome {
        let provisioned = match self.handles.create_channel(self.shared.config.pipe_size_kb) {
            Ok(provisioned) => provisioned,
            Err(e) => {
                self.rendezvous
                    .write(&RendezvousRecord::status(STATUS_FAILURE));
                return OfferOutcome::Settled(Err(HandshakeError::CreateChannel(e)));
            }
        };

        self.rendezvous.write(&RendezvousRecord {
            version: STATUS_ACCEPTED,
            process_id: self.handles.process_id(),
            channel: provisioned.write_handle,
            flow_control: provisioned.flow_control_handle,
        });
        self.rendezvous.accept();

        let confirmed = self
            .rendezvous
            .wait_ready(Some(self.shared.config.communication_timeout))
            .await;

        let outcome = if !confirmed {
            OfferOutcome::Settled(Err(HandshakeError::ConfirmationTimeout))
        } else {
            let reply = self.rendezvous.read();
            match RendezvousRequest::classify(reply.version) {
                RendezvousRequest::Stale(STATUS_HANDLES_TAKEN)
                    if reply.process_id == request.process_id =>
                {
                    OfferOutcome::Settled(
                        self.start_worker(
                            generation,
                            reply.process_id,
                            provisioned.reader,
                            provisioned.flow_control,
                        )
                        .await,
                    )
                }
                RendezvousRequest::Stale(STATUS_HANDLES_TAKEN) => {
                    OfferOutcome::Settled(Err(HandshakeError::ConfirmationMismatch {
                        expected: request.process_id,
                        received: reply.process_id,
                    }))
                }
                RendezvousRequest::Stale(status) => {
                    OfferOutcome::Settled(Err(HandshakeError::ConfirmationRejected { status }))
                }
                RendezvousRequest::Connect(_) | RendezvousRequest::Unsupported(_) => {
                    tracing::warn!(
                        offered_to = request.process_id,
                        process_id = reply.process_id,
                        "New request arrived before the offered channel was confirmed"
                    );
                    OfferOutcome::Superseded(reply)
                }
            }
        };

        if let OfferOutcome::Settled(result) = &outcome {
            let status = if result.is_ok() {
                STATUS_WORKER_STARTED
            } else {
                STATUS_FAILURE
            };
            self.rendezvous.write(&RendezvousRecord::status(status));
        }

        self.handles.close(provisioned.write_handle);
        self.handles.close(provisioned.flow_control_handle);
        outcome
    }

    async fn start_worker(
        &self,
        generation: ProtocolGeneration,
        process_id: u32,
        channel: H::Channel,
        flow_control: H::FlowControl,
    ) -> Result<Accepted, HandshakeError> {
        let registry = &self.shared.registry;
        let new_process = registry.is_new_process(process_id).await;
        let ticket = registry
            .register(process_id, generation)
            .await
            .map_err(HandshakeError::WorkerStart)?;
        let client = ClientContext::from(&ticket);

        if new_process && !generation.announces_auto_clear() {
            self.shared.post(ServerEvent::ProcessConnected(client));
        }

        let worker = ClientWorker::new(
            self.shared.clone(),
            ticket,
            channel,
            flow_control,
            new_process && generation.announces_auto_clear(),
        );
        let task = tokio::spawn(worker.run());
        registry.attach(client.worker_id, task).await;

        Ok(Accepted {
            client,
            new_process,
        })
    }

    fn report_failure(&self, err: HandshakeError) {
        self.shared.stats.record_handshake(false);
        tracing::warn!(error = %err, "Handshake failed");
        self.shared.post(ServerEvent::Failure(Error::Handshake(err)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{HandleId, LocalHost, LocalSemaphore, ProvisionedChannel};
    use crate::server::ServerConfig;
    use std::collections::VecDeque;
    use std::future::Future;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;

    /// Rendezvous driven by a script of client answers
    #[derive(Default)]
    struct ScriptedRendezvous {
        region: Mutex<RendezvousRecord>,
        written: Mutex<Vec<RendezvousRecord>>,
        /// Answer to each bounded wait, `None` lets it time out
        replies: Mutex<VecDeque<Option<RendezvousRecord>>>,
        accepts: AtomicUsize,
    }

    impl ScriptedRendezvous {
        fn with_request(request: RendezvousRecord) -> Self {
            let rendezvous = Self::default();
            *rendezvous.region.lock().unwrap() = request;
            rendezvous
        }

        fn reply(self, reply: Option<RendezvousRecord>) -> Self {
            self.replies.lock().unwrap().push_back(reply);
            self
        }

        fn accepts(&self) -> usize {
            self.accepts.load(Ordering::SeqCst)
        }

        fn statuses(&self) -> Vec<i32> {
            self.written.lock().unwrap().iter().map(|r| r.version).collect()
        }
    }

    impl Rendezvous for ScriptedRendezvous {
        fn open(&self) {}

        fn close(&self) {}

        fn read(&self) -> RendezvousRecord {
            *self.region.lock().unwrap()
        }

        fn write(&self, record: &RendezvousRecord) {
            *self.region.lock().unwrap() = *record;
            self.written.lock().unwrap().push(*record);
        }

        fn wait_ready(&self, timeout: Option<Duration>) -> impl Future<Output = bool> + Send {
            async move {
                if timeout.is_none() {
                    std::future::pending::<()>().await;
                }
                let next = self.replies.lock().unwrap().pop_front().flatten();
                match next {
                    Some(record) => {
                        *self.region.lock().unwrap() = record;
                        true
                    }
                    None => false,
                }
            }
        }

        fn accept(&self) {
            self.accepts.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Handle table that cannot duplicate or create anything
    struct BrokenTable;

    impl HandleTable for BrokenTable {
        type Channel = DuplexStream;
        type FlowControl = Arc<LocalSemaphore>;

        fn process_id(&self) -> u32 {
            1
        }

        fn duplicate_from(
            &self,
            _process_id: u32,
            _channel: HandleId,
            _flow_control: HandleId,
        ) -> io::Result<(DuplexStream, Arc<LocalSemaphore>)> {
            Err(io::ErrorKind::PermissionDenied.into())
        }

        fn create_channel(
            &self,
            _size_kb: u32,
        ) -> io::Result<ProvisionedChannel<DuplexStream, Arc<LocalSemaphore>>> {
            Err(io::Error::new(io::ErrorKind::Other, "no handles left"))
        }

        fn close(&self, _handle: HandleId) {}
    }

    struct Fixture<H: HandleTable> {
        broker: ConnectionBroker<H, ScriptedRendezvous>,
        rendezvous: Arc<ScriptedRendezvous>,
        events: mpsc::UnboundedReceiver<ServerEvent>,
    }

    impl<H: HandleTable> Fixture<H> {
        fn new(handles: Arc<H>, rendezvous: ScriptedRendezvous) -> Self {
            let (shared, events) = ServerShared::new(ServerConfig::default());
            let rendezvous = Arc::new(rendezvous);
            Self {
                broker: ConnectionBroker::new(shared, handles, rendezvous.clone()),
                rendezvous,
                events,
            }
        }

        fn shared(&self) -> &ServerShared {
            &self.broker.shared
        }

        fn failures(&mut self) -> Vec<HandshakeError> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                if let ServerEvent::Failure(Error::Handshake(err)) = event {
                    out.push(err);
                }
            }
            out
        }
    }

    fn confirmation(process_id: u32) -> RendezvousRecord {
        RendezvousRecord {
            version: STATUS_HANDLES_TAKEN,
            process_id,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_unsupported_version_refused_once() {
        let request = RendezvousRecord {
            version: 9,
            process_id: 42,
            ..Default::default()
        };
        let mut fixture = Fixture::new(Arc::new(BrokenTable), ScriptedRendezvous::with_request(request));

        assert_eq!(fixture.broker.serve_request().await, RequestOutcome::Failed);
        assert_eq!(fixture.rendezvous.statuses(), vec![STATUS_FAILURE]);
        assert_eq!(fixture.rendezvous.accepts(), 1);
        assert!(matches!(
            fixture.failures()[..],
            [HandshakeError::UnsupportedVersion {
                version: 9,
                process_id: 42
            }]
        ));
        assert_eq!(fixture.shared().stats.snapshot().handshakes_rejected, 1);
    }

    #[tokio::test]
    async fn test_stale_status_refused_and_released() {
        let mut fixture = Fixture::new(
            Arc::new(BrokenTable),
            ScriptedRendezvous::with_request(confirmation(42)),
        );

        assert_eq!(fixture.broker.serve_request().await, RequestOutcome::Stale);
        assert_eq!(fixture.rendezvous.statuses(), vec![STATUS_FAILURE]);
        assert_eq!(fixture.rendezvous.accepts(), 1);
        assert!(fixture.failures().is_empty());
        assert_eq!(fixture.shared().stats.snapshot().stale_requests, 1);
    }

    #[tokio::test]
    async fn test_client_channel_accepted() {
        let host = LocalHost::new();
        let server = host.spawn_process();
        let client = host.spawn_process();
        let (channel, _writer) = client.create_pipe(4);
        let (flow_control, _) = client.create_semaphore(4, 4);
        let request = RendezvousRecord {
            version: ProtocolGeneration::ClientChannel.version(),
            process_id: client.id(),
            channel,
            flow_control,
        };
        let fixture = Fixture::new(server, ScriptedRendezvous::with_request(request));

        let outcome = fixture.broker.serve_request().await;
        assert!(matches!(
            outcome,
            RequestOutcome::Accepted(Accepted { client: c, new_process: true }) if c.process_id == client.id()
        ));
        assert_eq!(fixture.rendezvous.statuses(), vec![STATUS_ACCEPTED]);
        assert_eq!(fixture.rendezvous.accepts(), 1);
        assert_eq!(fixture.shared().registry.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_duplication_failure() {
        let request = RendezvousRecord::request(ProtocolGeneration::ClientChannel, 42);
        let mut fixture = Fixture::new(Arc::new(BrokenTable), ScriptedRendezvous::with_request(request));

        assert_eq!(fixture.broker.serve_request().await, RequestOutcome::Failed);
        assert_eq!(fixture.rendezvous.statuses(), vec![STATUS_FAILURE]);
        assert_eq!(fixture.rendezvous.accepts(), 1);
        assert!(matches!(
            fixture.failures()[..],
            [HandshakeError::DuplicateHandle { process_id: 42, .. }]
        ));
    }

    #[tokio::test]
    async fn test_create_channel_failure() {
        let request = RendezvousRecord::request(ProtocolGeneration::ServerChannel, 42);
        let mut fixture = Fixture::new(Arc::new(BrokenTable), ScriptedRendezvous::with_request(request));

        assert_eq!(fixture.broker.serve_request().await, RequestOutcome::Failed);
        assert_eq!(fixture.rendezvous.statuses(), vec![STATUS_FAILURE]);
        assert_eq!(fixture.rendezvous.accepts(), 1);
        assert!(matches!(
            fixture.failures()[..],
            [HandshakeError::CreateChannel(_)]
        ));
    }

    #[tokio::test]
    async fn test_server_channel_confirmed() {
        let host = LocalHost::new();
        let server = host.spawn_process();
        let request = RendezvousRecord::request(ProtocolGeneration::LegacyServerChannel, 42);
        let rendezvous = ScriptedRendezvous::with_request(request).reply(Some(confirmation(42)));
        let mut fixture = Fixture::new(server.clone(), rendezvous);

        let outcome = fixture.broker.serve_request().await;
        assert!(matches!(outcome, RequestOutcome::Accepted(a) if a.client.process_id == 42));
        assert_eq!(
            fixture.rendezvous.statuses(),
            vec![STATUS_ACCEPTED, STATUS_WORKER_STARTED]
        );
        assert_eq!(fixture.rendezvous.accepts(), 2);
        assert_eq!(server.handle_count(), 0);

        // Legacy clients never announce themselves, so the broker does
        let event = fixture.events.try_recv().unwrap();
        assert!(matches!(event, ServerEvent::ProcessConnected(c) if c.process_id == 42));
    }

    #[tokio::test]
    async fn test_confirmation_timeout() {
        let host = LocalHost::new();
        let server = host.spawn_process();
        let request = RendezvousRecord::request(ProtocolGeneration::ServerChannel, 42);
        let rendezvous = ScriptedRendezvous::with_request(request).reply(None);
        let mut fixture = Fixture::new(server.clone(), rendezvous);

        assert_eq!(fixture.broker.serve_request().await, RequestOutcome::Failed);
        assert_eq!(
            fixture.rendezvous.statuses(),
            vec![STATUS_ACCEPTED, STATUS_FAILURE]
        );
        assert_eq!(fixture.rendezvous.accepts(), 2);
        assert_eq!(server.handle_count(), 0);
        assert!(matches!(
            fixture.failures()[..],
            [HandshakeError::ConfirmationTimeout]
        ));
    }

    #[tokio::test]
    async fn test_confirmation_from_other_process() {
        let host = LocalHost::new();
        let request = RendezvousRecord::request(ProtocolGeneration::ServerChannel, 42);
        let rendezvous = ScriptedRendezvous::with_request(request).reply(Some(confirmation(43)));
        let mut fixture = Fixture::new(host.spawn_process(), rendezvous);

        assert_eq!(fixture.broker.serve_request().await, RequestOutcome::Failed);
        assert_eq!(
            fixture.rendezvous.statuses(),
            vec![STATUS_ACCEPTED, STATUS_FAILURE]
        );
        assert_eq!(fixture.rendezvous.accepts(), 2);
        assert!(matches!(
            fixture.failures()[..],
            [HandshakeError::ConfirmationMismatch {
                expected: 42,
                received: 43
            }]
        ));
        assert_eq!(fixture.shared().registry.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_confirmation_rejected_by_client() {
        let host = LocalHost::new();
        let request = RendezvousRecord::request(ProtocolGeneration::ServerChannel, 42);
        let rendezvous = ScriptedRendezvous::with_request(request)
            .reply(Some(RendezvousRecord::status(STATUS_FAILURE)));
        let mut fixture = Fixture::new(host.spawn_process(), rendezvous);

        assert_eq!(fixture.broker.serve_request().await, RequestOutcome::Failed);
        assert_eq!(fixture.rendezvous.accepts(), 2);
        assert!(matches!(
            fixture.failures()[..],
            [HandshakeError::ConfirmationRejected { status: 0 }]
        ));
    }

    #[tokio::test]
    async fn test_new_request_supersedes_abandoned_offer() {
        let host = LocalHost::new();
        let server = host.spawn_process();
        let healthy = host.spawn_process();
        let (channel, _writer) = healthy.create_pipe(4);
        let (flow_control, _) = healthy.create_semaphore(4, 4);
        let next_request = RendezvousRecord {
            version: ProtocolGeneration::ClientChannel.version(),
            process_id: healthy.id(),
            channel,
            flow_control,
        };

        let abandoned = RendezvousRecord::request(ProtocolGeneration::ServerChannel, 42);
        let rendezvous = ScriptedRendezvous::with_request(abandoned).reply(Some(next_request));
        let mut fixture = Fixture::new(server.clone(), rendezvous);

        let outcome = fixture.broker.serve_request().await;
        assert!(matches!(
            outcome,
            RequestOutcome::Accepted(a) if a.client.process_id == healthy.id()
        ));
        // Offer, then the healthy client's answer; nothing written over its request
        assert_eq!(
            fixture.rendezvous.statuses(),
            vec![STATUS_ACCEPTED, STATUS_ACCEPTED]
        );
        assert_eq!(fixture.rendezvous.accepts(), 2);
        assert_eq!(server.handle_count(), 0);
        assert_eq!(fixture.shared().registry.process_ids().await, vec![healthy.id()]);
        assert!(matches!(
            fixture.failures()[..],
            [HandshakeError::Abandoned { process_id: 42 }]
        ));
    }
}
