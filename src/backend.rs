use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures_util::stream::{self, StreamExt};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::blobstore::{BlobStore, BlobUid};
use crate::catalog::Block;
use crate::config::{BackendConfig, RetryConfig};
use crate::error::{Error, Result};
use crate::throttle::TokenBucket;

/// A finished read, as handed out by [`DataBackend::read_get`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadCompletion {
    pub block: Block,
    pub offset: u64,
    pub length: u64,
    /// `None` if the blob does not exist.
    pub data: Option<Vec<u8>>,
}

impl ReadCompletion {
    fn new(block: Block, data: Option<Vec<u8>>) -> Self {
        let length = data.as_ref().map_or(0, |data| data.len() as u64);
        Self {
            block,
            offset: 0,
            length,
            data,
        }
    }
}

/// State shared between the backend handle and its workers.
struct Shared {
    /// The first unrecoverable error, once there is one.
    fatal: watch::Sender<Option<Arc<Error>>>,
    /// Writes accepted but not yet finished.
    pending_writes: watch::Sender<usize>,
}

impl Shared {
    fn new() -> Self {
        Self {
            fatal: watch::Sender::new(None),
            pending_writes: watch::Sender::new(0),
        }
    }

    fn fatal(&self) -> Option<Arc<Error>> {
        self.fatal.borrow().clone()
    }

    /// Records `err` unless another error got there first, and returns the
    /// error that is now stored.
    fn set_fatal(&self, err: Error) -> Arc<Error> {
        let candidate = Arc::new(err);
        let mut stored = Arc::clone(&candidate);
        self.fatal.send_if_modified(|slot| match slot {
            Some(existing) => {
                stored = Arc::clone(existing);
                false
            }
            None => {
                *slot = Some(candidate);
                true
            }
        });
        stored
    }

    async fn wait_fatal(&self) -> Arc<Error> {
        let mut fatal = self.fatal.subscribe();
        loop {
            let current = fatal.borrow_and_update().clone();
            if let Some(err) = current {
                return err;
            }
            if fatal.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }
}

/// Counts a write as pending for as long as it exists.
struct PendingWrite(Arc<Shared>);

impl PendingWrite {
    fn new(shared: &Arc<Shared>) -> Self {
        shared.pending_writes.send_modify(|pending| *pending += 1);
        Self(Arc::clone(shared))
    }
}

impl Drop for PendingWrite {
    fn drop(&mut self) {
        self.0
            .pending_writes
            .send_modify(|pending| *pending = pending.saturating_sub(1));
    }
}

struct WriteJob {
    uid: BlobUid,
    data: Vec<u8>,
    done: Option<oneshot::Sender<Result<()>>>,
    _pending: PendingWrite,
}

enum WriteMsg {
    Job(WriteJob),
    Stop,
}

struct ReadJob {
    block: Block,
    /// Synchronous requests get their own reply channel, the rest goes to
    /// the shared completion queue.
    reply: Option<oneshot::Sender<Result<ReadCompletion>>>,
}

enum ReadMsg {
    Job(ReadJob),
    Stop,
}

/// A content-addressed blob store with a pool of background writers and readers.
///
/// Writes go through a bounded queue, so producers are throttled by the
/// store once the queue is full. Any write error is fatal: it is recorded,
/// all workers wind down, and every later call fails with
/// [`Error::Fatal`]. Reads that fail with something other than "not found"
/// are retried according to the [`RetryConfig`].
///
/// Synchronous and pipelined reads ([`read`](Self::read) +
/// [`read_get`](Self::read_get)) use separate completion paths, but a
/// pipelined consumer has to drain every read it issued.
pub struct DataBackend<S> {
    store: Arc<S>,
    shared: Arc<Shared>,

    write_tx: flume::Sender<WriteMsg>,
    write_rx: flume::Receiver<WriteMsg>,
    read_tx: flume::Sender<ReadMsg>,
    read_rx: flume::Receiver<ReadMsg>,
    read_done: flume::Receiver<Result<ReadCompletion>>,
    write_throttle: Arc<TokenBucket>,
    read_throttle: Arc<TokenBucket>,

    writers: Mutex<Vec<JoinHandle<()>>>,
    readers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    /// Set once `close` joined all workers.
    stopped: AtomicBool,
    delete_concurrency: usize,
}

impl<S: BlobStore> DataBackend<S> {
    /// Creates the blob container and starts the worker pools.
    pub async fn new(store: S, config: &BackendConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(store);
        let shared = Arc::new(Shared::new());

        if let Err(err) = store.create_container().await {
            error!(bucket = %config.bucket_name, error = %err, "unable to create blob container");
            return Err(Error::Fatal(shared.set_fatal(err)));
        }

        let (write_tx, write_rx) = flume::bounded(config.write_queue_len());
        let (read_tx, read_rx) = flume::unbounded();
        let (done_tx, read_done) = flume::bounded(config.read_queue_len());

        let write_throttle = Arc::new(TokenBucket::new(config.bandwidth_write));
        let read_throttle = Arc::new(TokenBucket::new(config.bandwidth_read));

        let writers: Vec<_> = (0..config.simultaneous_writes)
            .map(|id| {
                let worker = Worker {
                    id,
                    store: Arc::clone(&store),
                    shared: Arc::clone(&shared),
                    throttle: Arc::clone(&write_throttle),
                };
                tokio::spawn(worker.write_loop(write_rx.clone()))
            })
            .collect();
        let readers: Vec<_> = (0..config.simultaneous_reads)
            .map(|id| {
                let worker = Worker {
                    id,
                    store: Arc::clone(&store),
                    shared: Arc::clone(&shared),
                    throttle: Arc::clone(&read_throttle),
                };
                tokio::spawn(worker.read_loop(
                    read_rx.clone(),
                    done_tx.clone(),
                    config.retry.clone(),
                ))
            })
            .collect();

        debug!(
            bucket = %config.bucket_name,
            writers = config.simultaneous_writes,
            readers = config.simultaneous_reads,
            "data backend started"
        );

        Ok(Self {
            store,
            shared,
            write_tx,
            write_rx,
            read_tx,
            read_rx,
            read_done,
            write_throttle,
            read_throttle,
            writers: Mutex::new(writers),
            readers: Mutex::new(readers),
            closed: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            delete_concurrency: config.simultaneous_writes,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// The error that stopped this backend, if any.
    pub fn fatal_error(&self) -> Option<Arc<Error>> {
        self.shared.fatal()
    }

    /// Changes the read bandwidth limit of all readers, 0 means unlimited.
    pub fn set_bandwidth_read(&self, bytes_per_second: u64) {
        self.read_throttle.set_rate(bytes_per_second);
    }

    pub fn set_bandwidth_write(&self, bytes_per_second: u64) {
        self.write_throttle.set_rate(bytes_per_second);
    }

    fn ensure_open(&self) -> Result<()> {
        if let Some(err) = self.shared.fatal() {
            return Err(Error::Fatal(err));
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn terminal_error(&self) -> Error {
        self.shared.fatal().map_or(Error::Closed, Error::Fatal)
    }

    async fn enqueue_write(
        &self,
        data: Vec<u8>,
        done: Option<oneshot::Sender<Result<()>>>,
    ) -> Result<BlobUid> {
        self.ensure_open()?;

        let awaited = done.is_some();
        let uid = BlobUid::generate();
        let job = WriteJob {
            uid: uid.clone(),
            data,
            done,
            _pending: PendingWrite::new(&self.shared),
        };
        tokio::select! {
            biased;
            sent = self.write_tx.send_async(WriteMsg::Job(job)) => {
                sent.map_err(|_| Error::Closed)?;
            }
            err = self.shared.wait_fatal() => return Err(Error::Fatal(err)),
        }

        if self.closed.load(Ordering::SeqCst) {
            // raced with `close`: if the workers are gone, nobody drains the queue but us
            if self.stopped.load(Ordering::SeqCst) {
                drop(self.write_rx.drain());
            }
            if !awaited {
                return Err(Error::Closed);
            }
        }
        Ok(uid)
    }

    /// Queues `data` for writing and returns its new uid.
    ///
    /// Waits while the write queue is full.
    pub async fn save(&self, data: Vec<u8>) -> Result<BlobUid> {
        self.enqueue_write(data, None).await
    }

    /// Like [`save`](Self::save), but returns only once the blob is stored.
    pub async fn save_sync(&self, data: Vec<u8>) -> Result<BlobUid> {
        let (done_tx, done_rx) = oneshot::channel();
        let uid = self.enqueue_write(data, Some(done_tx)).await?;

        tokio::select! {
            biased;
            done = done_rx => match done {
                Ok(result) => result.map(|()| uid),
                Err(_) => Err(self.terminal_error()),
            },
            err = self.shared.wait_fatal() => Err(Error::Fatal(err)),
        }
    }

    /// Waits until every write accepted so far has been stored.
    pub async fn flush(&self) -> Result<()> {
        let mut pending = self.shared.pending_writes.subscribe();
        loop {
            // failed writes no longer count as pending, so check this first
            if let Some(err) = self.shared.fatal() {
                return Err(Error::Fatal(err));
            }
            let idle = *pending.borrow_and_update() == 0;
            if idle {
                return Ok(());
            }
            tokio::select! {
                biased;
                err = self.shared.wait_fatal() => return Err(Error::Fatal(err)),
                changed = pending.changed() => {
                    if changed.is_err() {
                        return Err(self.terminal_error());
                    }
                }
            }
        }
    }

    /// Queues a read of `block`; the result is picked up with [`read_get`](Self::read_get).
    pub fn read(&self, block: &Block) -> Result<()> {
        self.ensure_open()?;
        let job = ReadJob {
            block: block.clone(),
            reply: None,
        };
        self.read_tx
            .send(ReadMsg::Job(job))
            .map_err(|_| Error::Closed)
    }

    /// Reads the blob of `block` and waits for its contents.
    pub async fn read_sync(&self, block: &Block) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = ReadJob {
            block: block.clone(),
            reply: Some(reply_tx),
        };
        self.read_tx
            .send(ReadMsg::Job(job))
            .map_err(|_| Error::Closed)?;

        let completion = tokio::select! {
            biased;
            reply = reply_rx => reply.map_err(|_| self.terminal_error())??,
            err = self.shared.wait_fatal() => return Err(Error::Fatal(err)),
        };
        if completion.block.id != block.id || completion.block.uid != block.uid {
            return Err(Error::ReadMismatch {
                expected: block.id,
                got: completion.block.id,
            });
        }
        completion
            .data
            .ok_or_else(|| Error::BlobNotFound(block.uid.clone()))
    }

    /// Takes the next finished pipelined read, in completion order.
    pub async fn read_get(&self) -> Result<ReadCompletion> {
        self.read_done
            .recv_async()
            .await
            .map_err(|_| self.terminal_error())?
    }

    /// Number of reads waiting for a reader.
    pub fn read_queue_size(&self) -> usize {
        self.read_tx.len()
    }

    pub async fn rm(&self, uid: &BlobUid) -> Result<()> {
        self.store.delete_blob(uid).await
    }

    /// Removes all `uids` it can and returns the ones that could not be removed.
    pub async fn rm_many(&self, uids: Vec<BlobUid>) -> Vec<BlobUid> {
        let store = &self.store;
        let mut failed: Vec<BlobUid> = stream::iter(uids)
            .map(|uid| async move {
                match store.delete_blob(&uid).await {
                    Ok(()) => None,
                    Err(err) => {
                        warn!(%uid, error = %err, "unable to remove blob");
                        Some(uid)
                    }
                }
            })
            .buffer_unordered(self.delete_concurrency)
            .filter_map(|failed| async move { failed })
            .collect()
            .await;
        failed.sort_unstable();
        failed
    }

    pub async fn get_all_blob_uids(&self, prefix: Option<&str>) -> Result<Vec<BlobUid>> {
        self.store.list_blobs(prefix).await
    }

    /// Stops all workers after they finished the work queued before.
    ///
    /// Calling this more than once, or after a fatal error, is fine.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let writers = std::mem::take(&mut *self.writers.lock().unwrap_or_else(PoisonError::into_inner));
        for _ in &writers {
            tokio::select! {
                biased;
                _ = self.write_tx.send_async(WriteMsg::Stop) => {}
                // dead writers will never free up queue space
                _ = self.shared.wait_fatal() => {
                    let _ = self.write_tx.try_send(WriteMsg::Stop);
                }
            }
        }
        for handle in writers {
            if let Err(err) = handle.await {
                warn!(error = %err, "writer task failed");
            }
        }

        let readers = std::mem::take(&mut *self.readers.lock().unwrap_or_else(PoisonError::into_inner));
        for _ in &readers {
            let _ = self.read_tx.send(ReadMsg::Stop);
        }
        let mut discarded = 0;
        for mut handle in readers {
            // a reader may be stuck on a full completion queue nobody drains anymore
            loop {
                tokio::select! {
                    biased;
                    joined = &mut handle => {
                        if let Err(err) = joined {
                            warn!(error = %err, "reader task failed");
                        }
                        break;
                    }
                    completion = self.read_done.recv_async() => {
                        if completion.is_ok() {
                            discarded += 1;
                        }
                    }
                }
            }
        }

        self.stopped.store(true, Ordering::SeqCst);
        // anything still queued fails with `Closed` once its reply channel is gone
        let abandoned = self.write_rx.drain().count() + self.read_rx.drain().count();
        debug!(discarded, abandoned, "data backend closed");
    }
}

struct Worker<S> {
    id: usize,
    store: Arc<S>,
    shared: Arc<Shared>,
    throttle: Arc<TokenBucket>,
}

impl<S: BlobStore> Worker<S> {
    async fn write_loop(self, jobs: flume::Receiver<WriteMsg>) {
        while let Ok(WriteMsg::Job(job)) = jobs.recv_async().await {
            let WriteJob {
                uid,
                data,
                done,
                _pending,
            } = job;

            if let Some(err) = self.shared.fatal() {
                if let Some(done) = done {
                    let _ = done.send(Err(Error::Fatal(err)));
                }
                break;
            }

            tokio::time::sleep(self.throttle.consume(data.len())).await;
            let started = Instant::now();
            let bytes = data.len();

            match self.store.store_blob(&uid, data).await {
                Ok(()) => {
                    debug!(
                        writer = self.id,
                        %uid,
                        bytes,
                        elapsed = ?started.elapsed(),
                        queued = jobs.len(),
                        "wrote blob"
                    );
                    if let Some(done) = done {
                        let _ = done.send(Ok(()));
                    }
                }
                Err(err) => {
                    error!(writer = self.id, %uid, error = %err, "fatal error while writing blob");
                    let err = self.shared.set_fatal(err);
                    if let Some(done) = done {
                        let _ = done.send(Err(Error::Fatal(err)));
                    }
                    break;
                }
            }
        }
        debug!(writer = self.id, "writer finishing");
    }

    async fn read_loop(
        self,
        jobs: flume::Receiver<ReadMsg>,
        done: flume::Sender<Result<ReadCompletion>>,
        retry: RetryConfig,
    ) {
        while let Ok(ReadMsg::Job(ReadJob { block, reply })) = jobs.recv_async().await {
            let result = match self.shared.fatal() {
                Some(err) => Err(Error::Fatal(err)),
                None => self.fetch(&block, &retry, jobs.len()).await,
            };
            let failed = result.is_err();
            let result = result.map(|data| ReadCompletion::new(block, data));

            let delivered = match reply {
                Some(reply) => {
                    let _ = reply.send(result);
                    true
                }
                None => done.send_async(result).await.is_ok(),
            };
            if failed || !delivered {
                break;
            }
        }
        debug!(reader = self.id, "reader finishing");
    }

    async fn fetch(
        &self,
        block: &Block,
        retry: &RetryConfig,
        queued: usize,
    ) -> Result<Option<Vec<u8>>> {
        let started = Instant::now();
        let data = match fetch_with_retry(self.store.as_ref(), &block.uid, retry).await {
            Ok(data) => data,
            Err(err) => {
                error!(reader = self.id, uid = %block.uid, error = %err, "giving up on reading blob");
                return Err(Error::Fatal(self.shared.set_fatal(err)));
            }
        };

        match &data {
            Some(bytes) => {
                tokio::time::sleep(self.throttle.consume(bytes.len())).await;
                debug!(
                    reader = self.id,
                    uid = %block.uid,
                    bytes = bytes.len(),
                    elapsed = ?started.elapsed(),
                    queued,
                    "read blob"
                );
            }
            None => debug!(reader = self.id, uid = %block.uid, "blob not found"),
        }
        Ok(data)
    }
}

/// Fetches a blob, retrying errors other than "not found" with exponential
/// backoff and jitter.
async fn fetch_with_retry<S: BlobStore + ?Sized>(
    store: &S,
    uid: &BlobUid,
    retry: &RetryConfig,
) -> Result<Option<Vec<u8>>> {
    let mut delay_ms = retry.retry_delay_ms;
    let mut attempt: u32 = 0;

    loop {
        match store.fetch_blob(uid).await {
            Ok(data) => return Ok(data),
            Err(err) if !matches!(retry.max_retries, Some(max) if attempt >= max) => {
                attempt += 1;
                warn!(%uid, attempt, error = %err, "transient error while reading blob, retrying");

                let jitter = rand::random::<u64>() % delay_ms.max(1);
                tokio::time::sleep(Duration::from_millis(delay_ms.saturating_add(jitter))).await;
                delay_ms = delay_ms.saturating_mul(2).min(retry.retry_max_delay_ms);
            }
            Err(err) => return Err(err),
        }
    }
}
