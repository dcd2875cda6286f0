//! In-process host
//!
//! Models processes, their handle tables and the named rendezvous objects with
//! tokio primitives, so a server and any number of clients can share one
//! runtime. Channels are [`tokio::io::duplex`] pairs; closing the last
//! reference to a write end shows up as end-of-file on the read end.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use tokio::io::DuplexStream;
use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore};

use super::{FlowControl, HandleId, HandleTable, ProvisionedChannel, Rendezvous};
use crate::protocol::constants::RENDEZVOUS_RECORD_SIZE;
use crate::protocol::RendezvousRecord;

/// Shared write end of a channel
pub type PipeWriter = Arc<tokio::sync::Mutex<DuplexStream>>;

#[derive(Clone)]
enum KernelObject {
    /// Read end, moved out on duplication
    PipeReader(Arc<Mutex<Option<DuplexStream>>>),
    PipeWriter(PipeWriter),
    Semaphore(Arc<LocalSemaphore>),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn invalid_handle(handle: HandleId) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("invalid handle {:#x}", handle),
    )
}

/// Counting semaphore with a fixed maximum
pub struct LocalSemaphore {
    permits: Semaphore,
    max: u32,
    release_lock: Mutex<()>,
}

impl LocalSemaphore {
    pub fn new(initial: u32, max: u32) -> Self {
        Self {
            permits: Semaphore::new(initial.min(max) as usize),
            max,
            release_lock: Mutex::new(()),
        }
    }

    /// Current count
    pub fn available(&self) -> u32 {
        self.permits.available_permits() as u32
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    /// Take one unit, waiting while the count is zero
    pub async fn acquire(&self) -> io::Result<()> {
        self.permits
            .acquire()
            .await
            .map(|permit| permit.forget())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "semaphore closed"))
    }

    /// Take one unit if available
    pub fn try_acquire(&self) -> bool {
        self.permits
            .try_acquire()
            .map(|permit| permit.forget())
            .is_ok()
    }
}

impl FlowControl for LocalSemaphore {
    fn release(&self, units: u32) -> io::Result<()> {
        let _guard = lock(&self.release_lock);
        if self.available() as u64 + units as u64 > self.max as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "semaphore count would exceed its maximum",
            ));
        }
        self.permits.add_permits(units as usize);
        Ok(())
    }
}

impl std::fmt::Debug for LocalSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSemaphore")
            .field("available", &self.available())
            .field("max", &self.max)
            .finish()
    }
}

/// A simulated process and its handle table
pub struct LocalProcess {
    id: u32,
    host: Weak<LocalHost>,
    handles: Mutex<HashMap<HandleId, KernelObject>>,
    next_handle: AtomicU32,
    deny_duplication: AtomicBool,
}

impl LocalProcess {
    fn new(id: u32, host: Weak<LocalHost>) -> Self {
        Self {
            id,
            host,
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU32::new(4),
            deny_duplication: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Refuse to let other processes duplicate handles out of this one
    pub fn set_deny_duplication(&self, deny: bool) {
        self.deny_duplication.store(deny, Ordering::Relaxed);
    }

    fn insert(&self, object: KernelObject) -> HandleId {
        let handle = self.next_handle.fetch_add(4, Ordering::Relaxed);
        lock(&self.handles).insert(handle, object);
        handle
    }

    fn object(&self, handle: HandleId) -> Option<KernelObject> {
        lock(&self.handles).get(&handle).cloned()
    }

    /// Create a channel whose read end lives in this table
    ///
    /// Returns the read end's handle and the write end.
    pub fn create_pipe(&self, size_kb: u32) -> (HandleId, PipeWriter) {
        let (reader, writer) = tokio::io::duplex(size_kb.max(1) as usize * 1024);
        let handle = self.insert(KernelObject::PipeReader(Arc::new(Mutex::new(Some(reader)))));
        (handle, Arc::new(tokio::sync::Mutex::new(writer)))
    }

    pub fn create_semaphore(&self, initial: u32, max: u32) -> (HandleId, Arc<LocalSemaphore>) {
        let semaphore = Arc::new(LocalSemaphore::new(initial, max));
        let handle = self.insert(KernelObject::Semaphore(semaphore.clone()));
        (handle, semaphore)
    }

    /// Close a handle; returns false if it was not open
    pub fn close_handle(&self, handle: HandleId) -> bool {
        lock(&self.handles).remove(&handle).is_some()
    }

    pub fn handle_count(&self) -> usize {
        lock(&self.handles).len()
    }

    fn peer(&self, process_id: u32) -> io::Result<Arc<LocalProcess>> {
        let host = self
            .host
            .upgrade()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "host is gone"))?;
        let peer = host.process(process_id).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no process with id {}", process_id),
            )
        })?;
        if peer.deny_duplication.load(Ordering::Relaxed) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("access to process {} denied", process_id),
            ));
        }
        Ok(peer)
    }

    /// Duplicate a channel write end out of another process
    pub fn duplicate_writer(&self, process_id: u32, handle: HandleId) -> io::Result<PipeWriter> {
        match self.peer(process_id)?.object(handle) {
            Some(KernelObject::PipeWriter(writer)) => Ok(writer),
            _ => Err(invalid_handle(handle)),
        }
    }

    /// Duplicate a semaphore out of another process
    pub fn duplicate_semaphore(
        &self,
        process_id: u32,
        handle: HandleId,
    ) -> io::Result<Arc<LocalSemaphore>> {
        match self.peer(process_id)?.object(handle) {
            Some(KernelObject::Semaphore(semaphore)) => Ok(semaphore),
            _ => Err(invalid_handle(handle)),
        }
    }

    fn duplicate_reader(&self, process_id: u32, handle: HandleId) -> io::Result<DuplexStream> {
        match self.peer(process_id)?.object(handle) {
            Some(KernelObject::PipeReader(slot)) => lock(&slot).take().ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "read end already taken")
            }),
            _ => Err(invalid_handle(handle)),
        }
    }
}

impl HandleTable for LocalProcess {
    type Channel = DuplexStream;
    type FlowControl = Arc<LocalSemaphore>;

    fn process_id(&self) -> u32 {
        self.id
    }

    fn duplicate_from(
        &self,
        process_id: u32,
        channel: HandleId,
        flow_control: HandleId,
    ) -> io::Result<(DuplexStream, Arc<LocalSemaphore>)> {
        let semaphore = self.duplicate_semaphore(process_id, flow_control)?;
        let reader = self.duplicate_reader(process_id, channel)?;
        Ok((reader, semaphore))
    }

    fn create_channel(
        &self,
        size_kb: u32,
    ) -> io::Result<ProvisionedChannel<DuplexStream, Arc<LocalSemaphore>>> {
        let (reader, writer) = tokio::io::duplex(size_kb.max(1) as usize * 1024);
        let write_handle = self.insert(KernelObject::PipeWriter(Arc::new(
            tokio::sync::Mutex::new(writer),
        )));
        let (flow_control_handle, flow_control) = self.create_semaphore(size_kb, size_kb);
        Ok(ProvisionedChannel {
            reader,
            flow_control,
            write_handle,
            flow_control_handle,
        })
    }

    fn close(&self, handle: HandleId) {
        self.close_handle(handle);
    }
}

impl std::fmt::Debug for LocalProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalProcess")
            .field("id", &self.id)
            .field("handles", &self.handle_count())
            .finish()
    }
}

/// Named lock, shared region and the two signals
pub struct LocalRendezvous {
    lock: Arc<Semaphore>,
    open: AtomicBool,
    region: Mutex<[u8; RENDEZVOUS_RECORD_SIZE]>,
    /// Auto-reset: one `notify_one` wakes exactly one wait
    ready: Notify,
    /// Bumped on every "data accepted"
    accepted: watch::Sender<u64>,
}

impl LocalRendezvous {
    fn new() -> Self {
        let (accepted, _) = watch::channel(0);
        Self {
            lock: Arc::new(Semaphore::new(0)),
            open: AtomicBool::new(false),
            region: Mutex::new([0; RENDEZVOUS_RECORD_SIZE]),
            ready: Notify::new(),
            accepted,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Take the rendezvous lock, as a client does before a handshake
    pub async fn acquire(&self, timeout: Duration) -> io::Result<OwnedSemaphorePermit> {
        if !self.is_open() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "trace server is not running",
            ));
        }
        match tokio::time::timeout(timeout, self.lock.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "trace server has stopped",
            )),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "timed out waiting for the rendezvous lock",
            )),
        }
    }

    /// Write `record`, signal "data ready" and wait for "data accepted"
    ///
    /// Returns whatever the server left in the region. The caller must hold
    /// the lock.
    pub async fn transact(
        &self,
        record: RendezvousRecord,
        timeout: Duration,
    ) -> io::Result<RendezvousRecord> {
        let mut accepted = self.accepted.subscribe();
        self.write(&record);
        self.ready.notify_one();
        match tokio::time::timeout(timeout, accepted.changed()).await {
            Ok(Ok(())) => Ok(self.read()),
            Ok(Err(_)) => Err(io::Error::new(io::ErrorKind::BrokenPipe, "rendezvous gone")),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "server did not accept the rendezvous record",
            )),
        }
    }
}

impl Rendezvous for LocalRendezvous {
    fn open(&self) {
        if !self.open.swap(true, Ordering::AcqRel) {
            self.lock.add_permits(1);
        }
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
        self.lock.close();
    }

    fn read(&self) -> RendezvousRecord {
        RendezvousRecord::decode(&lock(&self.region)[..]).unwrap_or_default()
    }

    fn write(&self, record: &RendezvousRecord) {
        *lock(&self.region) = record.to_bytes();
    }

    fn wait_ready(&self, timeout: Option<Duration>) -> impl Future<Output = bool> + Send {
        async move {
            match timeout {
                Some(timeout) => tokio::time::timeout(timeout, self.ready.notified())
                    .await
                    .is_ok(),
                None => {
                    self.ready.notified().await;
                    true
                }
            }
        }
    }

    fn accept(&self) {
        self.accepted
            .send_modify(|epoch| *epoch = epoch.wrapping_add(1));
    }
}

/// A machine: processes plus the one named rendezvous
pub struct LocalHost {
    processes: RwLock<HashMap<u32, Arc<LocalProcess>>>,
    next_process_id: AtomicU32,
    rendezvous: Arc<LocalRendezvous>,
}

impl LocalHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            processes: RwLock::new(HashMap::new()),
            next_process_id: AtomicU32::new(1000),
            rendezvous: Arc::new(LocalRendezvous::new()),
        })
    }

    /// Start a new process with a fresh id
    pub fn spawn_process(self: &Arc<Self>) -> Arc<LocalProcess> {
        let id = self.next_process_id.fetch_add(4, Ordering::Relaxed);
        let process = Arc::new(LocalProcess::new(id, Arc::downgrade(self)));
        self.processes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, process.clone());
        process
    }

    pub fn process(&self, id: u32) -> Option<Arc<LocalProcess>> {
        self.processes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    /// Terminate a process, closing every handle in its table
    pub fn exit_process(&self, id: u32) -> bool {
        let removed = self
            .processes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        match removed {
            Some(process) => {
                lock(&process.handles).clear();
                true
            }
            None => false,
        }
    }

    pub fn rendezvous(&self) -> &Arc<LocalRendezvous> {
        &self.rendezvous
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_semaphore_rejects_overflow() {
        let semaphore = LocalSemaphore::new(98, 100);
        assert!(semaphore.release(2).is_ok());
        assert_eq!(semaphore.available(), 100);
        assert!(semaphore.release(1).is_err());
        assert_eq!(semaphore.available(), 100);
    }

    #[tokio::test]
    async fn test_semaphore_acquire_release() {
        let semaphore = LocalSemaphore::new(1, 2);
        semaphore.acquire().await.unwrap();
        assert!(!semaphore.try_acquire());
        semaphore.release(2).unwrap();
        assert!(semaphore.try_acquire());
        assert_eq!(semaphore.available(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_client_channel() {
        let host = LocalHost::new();
        let server = host.spawn_process();
        let client = host.spawn_process();

        let (read_handle, writer) = client.create_pipe(4);
        let (sem_handle, _) = client.create_semaphore(4, 4);

        let (mut reader, flow) = server
            .duplicate_from(client.id(), read_handle, sem_handle)
            .unwrap();
        assert_eq!(flow.available(), 4);

        writer.lock().await.write_all(b"abc").await.unwrap();
        let mut buf = [0u8; 3];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");

        // The read end moves on duplication
        assert!(server
            .duplicate_from(client.id(), read_handle, sem_handle)
            .is_err());
    }

    #[tokio::test]
    async fn test_duplication_denied() {
        let host = LocalHost::new();
        let server = host.spawn_process();
        let client = host.spawn_process();
        let (read_handle, _writer) = client.create_pipe(1);
        let (sem_handle, _) = client.create_semaphore(1, 1);

        client.set_deny_duplication(true);
        let err = server
            .duplicate_from(client.id(), read_handle, sem_handle)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn test_closing_last_writer_ends_stream() {
        let host = LocalHost::new();
        let server = host.spawn_process();
        let client = host.spawn_process();

        let mut provisioned = server.create_channel(2).unwrap();
        let writer = client
            .duplicate_writer(server.id(), provisioned.write_handle)
            .unwrap();
        server.close(provisioned.write_handle);

        writer.lock().await.write_all(b"x").await.unwrap();
        drop(writer);

        let mut rest = Vec::new();
        provisioned.reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"x");
    }

    #[tokio::test]
    async fn test_rendezvous_closed_until_opened() {
        let host = LocalHost::new();
        let rendezvous = host.rendezvous();
        let err = rendezvous
            .acquire(Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);

        rendezvous.open();
        let _permit = rendezvous.acquire(Duration::from_millis(10)).await.unwrap();
        let err = rendezvous
            .acquire(Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_transact() {
        let host = LocalHost::new();
        let rendezvous = host.rendezvous().clone();
        rendezvous.open();

        let server = {
            let rendezvous = rendezvous.clone();
            tokio::spawn(async move {
                assert!(rendezvous.wait_ready(None).await);
                let request = rendezvous.read();
                rendezvous.write(&RendezvousRecord::status(request.version + 1));
                rendezvous.accept();
            })
        };

        let reply = rendezvous
            .transact(RendezvousRecord::status(41), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply.version, 42);
        server.await.unwrap();
    }
}
