//! Trace server
//!
//! Wires the broker, the aggregator and the registry together and owns the
//! shutdown sequence:
//!
//! 1. stop the broker, which closes the rendezvous
//! 2. cancel every worker, wait out the grace period, abort the rest
//! 3. stop the aggregator after a final flush

use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::ipc::{HandleTable, Rendezvous};
use crate::log::{Directories, SharedLog};
use crate::registry::SessionRegistry;
use crate::stats::ServerStatsSnapshot;

use super::aggregator::LogAggregator;
use super::broker::ConnectionBroker;
use super::config::ServerConfig;
use super::display::TraceDisplay;
use super::shared::{ServerEvent, ServerShared};

/// Trace collection server
pub struct TraceServer<D: TraceDisplay> {
    shared: Arc<ServerShared>,
    display: Arc<D>,
    events: Mutex<Option<mpsc::UnboundedReceiver<ServerEvent>>>,
}

impl<D: TraceDisplay> TraceServer<D> {
    /// Create a new server with the given configuration and display
    pub fn new(config: ServerConfig, display: D) -> Self {
        let (shared, events) = ServerShared::new(config);
        Self {
            shared,
            display: Arc::new(display),
            events: Mutex::new(Some(events)),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn display(&self) -> &Arc<D> {
        &self.display
    }

    /// The ordered master log
    pub fn log(&self) -> &SharedLog {
        &self.shared.log
    }

    /// Process and thread names
    pub fn directories(&self) -> &Directories {
        &self.shared.directories
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.shared.registry
    }

    pub fn stats(&self) -> ServerStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Clear the master log
    pub fn clear(&self) {
        self.shared.post(ServerEvent::Clear);
    }

    /// Token that stops the server when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shared.shutdown.clone()
    }

    /// Run the server until it is shut down through [`Self::shutdown_token`]
    pub async fn run<H, R>(&self, handles: Arc<H>, rendezvous: Arc<R>) -> Result<()>
    where
        H: HandleTable,
        R: Rendezvous,
    {
        self.run_until(handles, rendezvous, std::future::pending())
            .await
    }

    /// Run the server with graceful shutdown
    ///
    /// Stops when `shutdown` resolves or the shutdown token is cancelled,
    /// for example after a low-memory condition.
    pub async fn run_until<H, R, F>(
        &self,
        handles: Arc<H>,
        rendezvous: Arc<R>,
        shutdown: F,
    ) -> Result<()>
    where
        H: HandleTable,
        R: Rendezvous,
        F: Future<Output = ()>,
    {
        let events = self
            .events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| {
                Error::Io(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "trace server already ran",
                ))
            })?;

        let aggregator_cancel = CancellationToken::new();
        let aggregator = LogAggregator::new(self.shared.clone(), self.display.clone(), events);
        let aggregator_task = tokio::spawn(aggregator.run(aggregator_cancel.clone()));

        let broker_cancel = self.shared.shutdown.child_token();
        let broker = ConnectionBroker::new(self.shared.clone(), handles, rendezvous);
        let broker_task = tokio::spawn(broker.run(broker_cancel.clone()));

        tracing::info!(
            cache_capacity = self.shared.config.cache_capacity,
            max_log_entries = ?self.shared.config.max_log_entries,
            "Trace server running"
        );

        tokio::select! {
            _ = shutdown => tracing::info!("Shutdown signal received"),
            _ = self.shared.shutdown.cancelled() => tracing::info!("Shutdown requested"),
        }

        broker_cancel.cancel();
        if let Err(e) = broker_task.await {
            tracing::error!(error = %e, "Broker task failed");
        }

        let report = self
            .shared
            .registry
            .shutdown(self.shared.config.shutdown_grace)
            .await;
        tracing::info!(
            cancelled = report.cancelled,
            aborted = report.aborted,
            "Workers stopped"
        );

        aggregator_cancel.cancel();
        if let Err(e) = aggregator_task.await {
            tracing::error!(error = %e, "Aggregator task failed");
        }

        tracing::info!(entries = self.shared.log.len(), "Trace server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientConfig, TraceClient};
    use crate::ipc::{LocalHost, LocalProcess};
    use crate::protocol::constants::{STATUS_ACCEPTED, STATUS_FAILURE, STATUS_HANDLES_TAKEN};
    use crate::protocol::{
        ProtocolGeneration, RendezvousRecord, TraceRecord, WireHeader, WireMessage,
    };
    use crate::server::display::testing::{Notification, RecordingDisplay};
    use bytes::BytesMut;
    use std::time::{Duration, Instant};

    struct Harness {
        host: Arc<LocalHost>,
        server: Arc<TraceServer<RecordingDisplay>>,
        task: tokio::task::JoinHandle<Result<()>>,
    }

    impl Harness {
        fn start(config: ServerConfig) -> Self {
            Self::start_exact(config.flush_interval(Duration::from_millis(10)))
        }

        /// Start without shortening the flush interval
        fn start_exact(config: ServerConfig) -> Self {
            let host = LocalHost::new();
            let server_process = host.spawn_process();
            let server = Arc::new(TraceServer::new(config, RecordingDisplay::default()));
            let task = {
                let server = server.clone();
                let rendezvous = host.rendezvous().clone();
                tokio::spawn(async move { server.run(server_process, rendezvous).await })
            };
            Self { host, server, task }
        }

        async fn connect(&self, process: &Arc<LocalProcess>, config: ClientConfig) -> TraceClient {
            // The broker opens the rendezvous once its task is scheduled
            for _ in 0..100 {
                if self.host.rendezvous().is_open() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            TraceClient::connect(&self.host, process.clone(), config)
                .await
                .expect("client should connect")
        }

        async fn wait_for<P: Fn(&TraceServer<RecordingDisplay>) -> bool>(&self, predicate: P) {
            for _ in 0..200 {
                if predicate(&self.server) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("condition not reached in time");
        }

        async fn wait_for_workers(&self, count: usize) {
            for _ in 0..200 {
                if self.server.registry().active_count().await == count {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("expected {} active workers", count);
        }

        async fn stop(self) -> Arc<TraceServer<RecordingDisplay>> {
            self.server.shutdown_token().cancel();
            self.task.await.unwrap().unwrap();
            self.server
        }
    }

    fn counter_record(client: &TraceClient, counter: f64, text: &str) -> TraceRecord {
        let mut record = client.record("test.cpp", 1, text);
        record.counter = counter;
        record
    }

    #[tokio::test]
    async fn test_every_generation_connects() {
        let harness = Harness::start(ServerConfig::default());

        for (i, generation) in ProtocolGeneration::ALL.into_iter().enumerate() {
            let process = harness.host.spawn_process();
            let mut client = harness
                .connect(&process, ClientConfig::new().generation(generation))
                .await;
            assert_eq!(client.generation(), generation);

            let record = counter_record(&client, (i + 1) as f64, &generation.to_string());
            client.information(record).await.unwrap();
            client.disconnect().await.unwrap();
        }

        harness.wait_for(|s| s.log().len() == 4).await;
        harness.wait_for_workers(0).await;
        let server = harness.stop().await;

        let texts: Vec<String> = server
            .log()
            .snapshot()
            .iter()
            .map(|e| e.message.to_string())
            .collect();
        assert_eq!(
            texts,
            vec![
                "v4 (client-created)",
                "v5 (server-created)",
                "v6 (client-created)",
                "v7 (server-created)"
            ]
        );
        assert_eq!(server.stats().handshakes_accepted, 4);
        let connected = server
            .display()
            .events()
            .into_iter()
            .filter(|n| matches!(n, Notification::Connected(_)))
            .count();
        assert_eq!(connected, 4);
    }

    #[tokio::test]
    async fn test_negotiation_prefers_client_channel() {
        let harness = Harness::start(ServerConfig::default());
        let process = harness.host.spawn_process();
        let client = harness.connect(&process, ClientConfig::default()).await;
        assert_eq!(client.generation(), ProtocolGeneration::ClientChannel);
        drop(client);
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_names_and_counter_order() {
        let harness = Harness::start(ServerConfig::default());
        let process = harness.host.spawn_process();
        let mut client = harness.connect(&process, ClientConfig::default()).await;

        client.set_process_name("Test").await.unwrap();
        client.set_thread_name(1, "main").await.unwrap();
        client.information(counter_record(&client, 1.0, "late")).await.unwrap();
        client.information(counter_record(&client, 0.5, "early")).await.unwrap();

        harness.wait_for(|s| s.log().len() == 2).await;
        let entries = harness.server.log().snapshot();
        assert_eq!(entries[0].counter, 0.5);
        assert_eq!(entries[1].counter, 1.0);

        let unique = entries[0].unique_process_id;
        assert_eq!(&*harness.server.directories().process_name(unique), "Test");
        assert_eq!(&*harness.server.directories().thread_name(unique, 1), "main");

        drop(client);
        let server = harness.stop().await;
        assert!(server.display().count(&Notification::ProcessesChanged) >= 1);
        assert_eq!(server.display().last_count(), Some(2));
    }

    #[tokio::test]
    async fn test_duplicate_process_announced_once() {
        let harness = Harness::start(ServerConfig::default());
        let process = harness.host.spawn_process();
        let pid = process.id();

        let first = harness.connect(&process, ClientConfig::default()).await;
        harness.wait_for_workers(1).await;
        let second = harness.connect(&process, ClientConfig::default()).await;
        harness.wait_for_workers(2).await;

        drop(first);
        drop(second);
        harness.wait_for_workers(0).await;
        let server = harness.stop().await;

        assert_eq!(server.display().count(&Notification::Connected(pid)), 1);
        assert_eq!(server.display().count(&Notification::Disconnected(pid)), 2);
    }

    #[tokio::test]
    async fn test_ignore_auto_clear_keeps_log() {
        let harness = Harness::start(ServerConfig::default().auto_clear_on_connect(true));
        let first = harness.host.spawn_process();
        let mut client = harness.connect(&first, ClientConfig::default()).await;
        let first_id = first.id();
        harness
            .wait_for(|s| s.display().count(&Notification::Connected(first_id)) == 1)
            .await;
        client.information(counter_record(&client, 1.0, "kept")).await.unwrap();
        harness.wait_for(|s| s.log().len() == 1).await;

        let second = harness.host.spawn_process();
        let _quiet = harness
            .connect(&second, ClientConfig::default().ignore_auto_clear(true))
            .await;
        harness.wait_for_workers(2).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(harness.server.log().len(), 1);

        let third = harness.host.spawn_process();
        let _loud = harness.connect(&third, ClientConfig::default()).await;
        harness.wait_for(|s| s.log().is_empty()).await;

        drop(client);
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_denied_duplication_does_not_stop_broker() {
        let harness = Harness::start(ServerConfig::default());
        let locked = harness.host.spawn_process();
        locked.set_deny_duplication(true);

        harness.wait_for(|_| harness.host.rendezvous().is_open()).await;
        let err = TraceClient::connect(
            &harness.host,
            locked.clone(),
            ClientConfig::new().generation(ProtocolGeneration::ClientChannel),
        )
        .await
        .err()
        .expect("duplication must fail");
        assert!(matches!(
            err,
            Error::Handshake(crate::error::HandshakeError::ConfirmationRejected { status: 0 })
        ));

        let healthy = harness.host.spawn_process();
        let mut client = harness.connect(&healthy, ClientConfig::default()).await;
        client.information(counter_record(&client, 1.0, "ok")).await.unwrap();
        harness.wait_for(|s| s.log().len() == 1).await;

        drop(client);
        let server = harness.stop().await;
        assert_eq!(server.stats().handshakes_rejected, 1);
        assert!(server.display().errors()[0].contains("Unable to duplicate handles"));
    }

    #[tokio::test]
    async fn test_unknown_message_disconnects_client() {
        let harness = Harness::start(ServerConfig::default());
        let process = harness.host.spawn_process();
        let mut client = harness.connect(&process, ClientConfig::default()).await;
        harness.wait_for_workers(1).await;

        let mut frame = BytesMut::new();
        WireHeader {
            raw_kind: 99,
            ..Default::default()
        }
        .encode(&mut frame);
        client.write_raw(&frame).await.unwrap();

        harness.wait_for_workers(0).await;
        let server = harness.stop().await;
        assert!(server
            .display()
            .errors()
            .iter()
            .any(|e| e.contains("Unknown message type 99")));
    }

    async fn send_from_clients(harness: &Harness, clients: usize, per_client: usize) {
        let mut connected = Vec::new();
        for _ in 0..clients {
            let process = harness.host.spawn_process();
            connected.push(harness.connect(&process, ClientConfig::default()).await);
        }

        let mut tasks = Vec::new();
        for (c, mut client) in connected.into_iter().enumerate() {
            tasks.push(tokio::spawn(async move {
                for i in 0..per_client {
                    let record = counter_record(&client, (c * per_client + i + 1) as f64, "line");
                    client.information(record).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_backpressure_loses_nothing() {
        let harness = Harness::start(ServerConfig::default().cache_capacity(8));
        send_from_clients(&harness, 4, 200).await;

        harness.wait_for(|s| s.log().len() == 800).await;
        let server = harness.stop().await;
        assert!(server.log().read().is_ordered());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_full_default_cache_flushes_early() {
        // Only a full cache can trigger a flush before shutdown
        let config = ServerConfig::default().flush_interval(Duration::from_secs(3600));
        let harness = Harness::start_exact(config);
        send_from_clients(&harness, 4, 400).await;

        harness
            .wait_for(|s| s.log().len() + s.shared.cache.len() == 1600)
            .await;
        assert!(harness.server.log().len() >= 1000);

        let server = harness.stop().await;
        assert_eq!(server.log().len(), 1600);
        assert!(server.log().read().is_ordered());
    }

    #[tokio::test]
    async fn test_abandoned_offer_does_not_block_next_client() {
        let harness = Harness::start(ServerConfig::default());
        harness.wait_for(|_| harness.host.rendezvous().is_open()).await;
        let rendezvous = harness.host.rendezvous();

        // Takes the offer, then goes away without confirming
        let vanished = harness.host.spawn_process();
        {
            let _lock = rendezvous.acquire(Duration::from_secs(1)).await.unwrap();
            let request = RendezvousRecord::request(ProtocolGeneration::ServerChannel, vanished.id());
            let offer = rendezvous
                .transact(request, Duration::from_secs(1))
                .await
                .unwrap();
            assert_eq!(offer.version, STATUS_ACCEPTED);
        }

        let healthy = harness.host.spawn_process();
        let config = ClientConfig::new().generation(ProtocolGeneration::ClientChannel);
        let mut client = harness.connect(&healthy, config).await;
        client.information(counter_record(&client, 1.0, "ok")).await.unwrap();
        harness.wait_for(|s| s.log().len() == 1).await;

        drop(client);
        let server = harness.stop().await;
        assert!(server
            .display()
            .errors()
            .iter()
            .any(|e| e.contains("abandoned the handshake")));
        assert_eq!(server.log().snapshot()[0].process_id, healthy.id());
    }

    #[tokio::test]
    async fn test_late_confirmation_released_promptly() {
        let config = ServerConfig::default().communication_timeout(Duration::from_millis(50));
        let harness = Harness::start(config);
        harness.wait_for(|_| harness.host.rendezvous().is_open()).await;
        let rendezvous = harness.host.rendezvous();

        let late = harness.host.spawn_process();
        {
            let _lock = rendezvous.acquire(Duration::from_secs(1)).await.unwrap();
            let request = RendezvousRecord::request(ProtocolGeneration::ServerChannel, late.id());
            let offer = rendezvous
                .transact(request, Duration::from_secs(1))
                .await
                .unwrap();
            assert_eq!(offer.version, STATUS_ACCEPTED);

            tokio::time::sleep(Duration::from_millis(150)).await;
            let confirmation = RendezvousRecord {
                version: STATUS_HANDLES_TAKEN,
                process_id: late.id(),
                ..Default::default()
            };
            let started = Instant::now();
            let verdict = rendezvous
                .transact(confirmation, Duration::from_secs(2))
                .await
                .expect("late confirmation must be answered");
            assert_eq!(verdict.version, STATUS_FAILURE);
            assert!(started.elapsed() < Duration::from_secs(1));
        }

        let healthy = harness.host.spawn_process();
        let client = harness.connect(&healthy, ClientConfig::default()).await;
        drop(client);

        let server = harness.stop().await;
        assert_eq!(server.stats().stale_requests, 1);
        assert!(server
            .display()
            .errors()
            .iter()
            .any(|e| e.contains("did not confirm")));
    }

    #[tokio::test]
    async fn test_large_message_under_flow_control() {
        let harness = Harness::start(ServerConfig::default());
        let process = harness.host.spawn_process();
        let mut client = harness
            .connect(&process, ClientConfig::default().pipe_size_kb(2))
            .await;

        let text = "x".repeat(10 * 1024);
        client.information(counter_record(&client, 1.0, &text)).await.unwrap();
        client
            .send(&WireMessage::SetProcessName {
                name: "big".into(),
            })
            .await
            .unwrap();

        harness.wait_for(|s| s.log().len() == 1).await;
        assert_eq!(harness.server.log().snapshot()[0].message.len(), 10 * 1024);
        drop(client);
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_idle_workers() {
        let harness =
            Harness::start(ServerConfig::default().shutdown_grace(Duration::from_millis(100)));
        let process = harness.host.spawn_process();
        let _client = harness.connect(&process, ClientConfig::default()).await;
        harness.wait_for_workers(1).await;

        let server = harness.stop().await;
        assert_eq!(server.registry().active_count().await, 0);
        assert!(!server.display().events().is_empty());
    }

    #[tokio::test]
    async fn test_server_runs_once() {
        let harness = Harness::start(ServerConfig::default());
        harness.wait_for(|_| harness.host.rendezvous().is_open()).await;
        let process = harness.host.spawn_process();
        let err = harness
            .server
            .run_until(process, harness.host.rendezvous().clone(), async {})
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(ref e) if e.kind() == io::ErrorKind::AlreadyExists));
        harness.stop().await;
    }
}
