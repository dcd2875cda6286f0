//! Trace server demo
//!
//! Starts a server on an in-process host, connects one client per protocol
//! generation, sends a few trace lines from each and prints the merged log.
//!
//! Run with: cargo run --example trace_server [LINES_PER_CLIENT]
//!
//! Set `RUST_LOG=trace_server=trace` to watch the handshakes and flushes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use trace_server::error::Error;
use trace_server::protocol::ProtocolGeneration;
use trace_server::server::ClientContext;
use trace_server::{ClientConfig, LocalHost, ServerConfig, TraceClient, TraceDisplay, TraceServer};

/// Display that prints every notification
struct ConsoleDisplay {
    count: AtomicUsize,
}

impl TraceDisplay for ConsoleDisplay {
    fn set_count(&self, count: usize) {
        self.count.store(count, Ordering::Relaxed);
    }

    fn notify_error(&self, error: &Error) {
        println!("! {}", error);
    }

    fn process_connected(&self, client: &ClientContext) {
        println!(
            "+ process {} connected ({})",
            client.process_id, client.generation
        );
    }

    fn notify_disconnect(&self, client: &ClientContext) {
        println!("- process {} disconnected", client.process_id);
    }

    fn error_entry_received(&self) {
        println!("! error entry received");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let lines: u32 = match std::env::args().nth(1) {
        Some(arg) => arg.parse()?,
        None => 5,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("trace_server=info".parse()?),
        )
        .init();

    let host = LocalHost::new();
    let config = ServerConfig::default()
        .max_log_entries(1000)
        .flush_interval(Duration::from_millis(20));
    let server = Arc::new(TraceServer::new(
        config,
        ConsoleDisplay {
            count: AtomicUsize::new(0),
        },
    ));

    let server_task = {
        let server = server.clone();
        let process = host.spawn_process();
        let rendezvous = host.rendezvous().clone();
        tokio::spawn(async move { server.run(process, rendezvous).await })
    };
    while !host.rendezvous().is_open() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let mut clients = Vec::new();
    for generation in ProtocolGeneration::ALL {
        let host = host.clone();
        clients.push(tokio::spawn(async move {
            let process = host.spawn_process();
            let config = ClientConfig::new().generation(generation);
            let mut client = TraceClient::connect(&host, process, config).await?;
            client
                .set_process_name(&format!("client {}", generation))
                .await?;
            client.set_thread_name(1, "main").await?;

            for i in 0..lines {
                let record = client.record(file!(), line!(), &format!("line {}", i));
                if i % 4 == 3 {
                    client.error(record).await?;
                } else {
                    client.information(record).await?;
                }
                tokio::time::sleep(Duration::from_millis(3)).await;
            }
            client.disconnect().await?;
            Ok::<_, Error>(())
        }));
    }
    for client in clients {
        client.await??;
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    server.shutdown_token().cancel();
    server_task.await??;

    println!();
    println!("=== {} entries ===", server.display().count.load(Ordering::Relaxed));
    let directories = server.directories();
    for entry in server.log().snapshot().iter() {
        println!(
            "{:>5} {:02}:{:02}:{:02}.{:03} [{}/{}] {}{}",
            entry.sequence_index,
            entry.timestamp.hour,
            entry.timestamp.minute,
            entry.timestamp.second,
            entry.timestamp.millisecond,
            directories.process_name(entry.unique_process_id),
            directories.thread_name(entry.unique_process_id, entry.unique_thread_id),
            if entry.is_error() { "ERROR " } else { "" },
            entry.message,
        );
    }

    let stats = server.stats();
    println!();
    println!(
        "handshakes={} rejected={} bytes={} flushes={}",
        stats.handshakes_accepted, stats.handshakes_rejected, stats.bytes_read, stats.flushes
    );
    Ok(())
}
