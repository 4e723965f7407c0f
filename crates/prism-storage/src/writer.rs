//! Asynchronous at-least-once request writer.
//!
//! The response path enqueues and returns; a single owner task drains the
//! queue into Postgres. The queue is bounded: overflow sheds the oldest
//! entry and bumps a warning counter rather than blocking a response.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::records::{ApiRequestRecord, RequestStore};

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Retry backoff for failed inserts; capped so a long outage cannot push
/// delays past ten seconds while the queue absorbs the burst.
const RETRY_BASE_MS: u64 = 200;
const RETRY_MAX_MS: u64 = 10_000;

/// One unit of persistence work: the request row plus its raw SSE chunks
/// (empty for non-streaming requests).
#[derive(Debug)]
pub struct WriteJob {
    pub record: ApiRequestRecord,
    pub chunks: Vec<String>,
}

/// Bounded drop-oldest queue. Kept separate from the task so overflow
/// behavior is testable without a database.
pub struct WriteQueue {
    jobs: Mutex<VecDeque<WriteJob>>,
    capacity: usize,
    dropped: AtomicU64,
    notify: Notify,
}

impl WriteQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            jobs: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    /// Enqueue without blocking. When full, the oldest job is shed.
    pub fn push(&self, job: WriteJob) {
        {
            let mut jobs = self.jobs.lock().unwrap();
            if jobs.len() == self.capacity {
                if let Some(shed) = jobs.pop_front() {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        request_id = %shed.record.request_id,
                        dropped_total = self.dropped.load(Ordering::Relaxed),
                        "writer queue full; dropping oldest record"
                    );
                }
            }
            jobs.push_back(job);
        }
        self.notify.notify_one();
    }

    pub fn pop(&self) -> Option<WriteJob> {
        self.jobs.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    async fn wait(&self) {
        self.notify.notified().await;
    }
}

/// Cheap handle given to request handlers.
#[derive(Clone)]
pub struct WriterHandle {
    queue: Arc<WriteQueue>,
    cancel: CancellationToken,
}

impl WriterHandle {
    pub fn enqueue(&self, job: WriteJob) {
        self.queue.push(job);
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    /// Signal shutdown. The owner task switches to a best-effort drain.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

pub struct RequestWriter;

impl RequestWriter {
    /// Spawn the writer task. Returns the handle and the join handle the
    /// process awaits (with a deadline) during shutdown.
    pub fn spawn(
        store: RequestStore,
        capacity: usize,
    ) -> (WriterHandle, tokio::task::JoinHandle<()>) {
        let queue = Arc::new(WriteQueue::new(capacity));
        let cancel = CancellationToken::new();
        let handle = WriterHandle {
            queue: queue.clone(),
            cancel: cancel.clone(),
        };
        let join = tokio::spawn(Self::run(store, queue, cancel));
        (handle, join)
    }

    async fn run(store: RequestStore, queue: Arc<WriteQueue>, cancel: CancellationToken) {
        loop {
            match queue.pop() {
                Some(job) => Self::write_with_retry(&store, job, &cancel).await,
                None => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    tokio::select! {
                        _ = queue.wait() => {}
                        _ = cancel.cancelled() => {}
                    }
                }
            }
        }
        debug!(remaining = queue.len(), "writer task stopped");
    }

    /// Insert one job, retrying on database failure with capped exponential
    /// backoff. During shutdown each job gets a single attempt so the drain
    /// finishes inside the process deadline.
    async fn write_with_retry(store: &RequestStore, job: WriteJob, cancel: &CancellationToken) {
        let request_id = job.record.request_id;
        let mut attempt: u32 = 0;
        loop {
            match Self::write_once(store, &job).await {
                Ok(inserted) => {
                    if !inserted {
                        debug!(%request_id, "record already persisted; replay ignored");
                    }
                    return;
                }
                Err(e) => {
                    warn!(%request_id, attempt, error = %e, "record insert failed");
                    if cancel.is_cancelled() {
                        warn!(%request_id, "abandoning record during shutdown drain");
                        return;
                    }
                    let backoff =
                        (RETRY_BASE_MS * 2u64.saturating_pow(attempt)).min(RETRY_MAX_MS);
                    attempt = attempt.saturating_add(1);
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(backoff)) => {}
                        _ = cancel.cancelled() => {}
                    }
                }
            }
        }
    }

    async fn write_once(
        store: &RequestStore,
        job: &WriteJob,
    ) -> crate::error::Result<bool> {
        let inserted = store.insert_request(&job.record).await?;
        if inserted && !job.chunks.is_empty() {
            store
                .insert_chunks(job.record.request_id, &job.chunks)
                .await?;
        }
        Ok(inserted)
    }
}
