//! Background reclamation of admission history.
//!
//! After a batch is evaluated, admitted keys are handed to a
//! [`CleanupScheduler`]. A single worker task owns the queue and applies the
//! store's expire-and-trim operation for each job. The worker lives
//! independently of the request that scheduled the job, so cancelling that
//! request never cancels its cleanup.
//!
//! Each job carries the timestamp of the evaluation that produced it, so the
//! trim bound is computed against the same time the markers were written at.
//!
//! Cleanup is best effort. Jobs that do not fit in the queue are dropped and
//! store failures are discarded; either way only the stored history grows a
//! little larger until the next successful run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::store::WindowStore;

/// Default number of jobs the queue holds before new ones are dropped.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// A request to reclaim history for a set of just-admitted keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupJob {
    /// Keys that were admitted
    pub keys: Vec<String>,
    /// Retention horizon in seconds
    pub expiration: u64,
    /// Timestamp of the evaluation that admitted the keys
    pub now: i64,
}

/// Messages consumed by the worker.
enum Command {
    Cleanup(CleanupJob),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// Counters describing what the worker has done so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    /// Jobs the store applied successfully
    pub completed: u64,
    /// Jobs whose store call failed
    pub failed: u64,
    /// Jobs dropped because the queue was full or closed
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Handle used to queue cleanup jobs for the background worker.
///
/// Cloning the handle shares the same worker and queue.
#[derive(Clone)]
pub struct CleanupScheduler {
    sender: mpsc::Sender<Command>,
    counters: Arc<Counters>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for CleanupScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupScheduler")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl CleanupScheduler {
    /// Spawn the worker on the current tokio runtime.
    ///
    /// `capacity` is clamped to at least one job.
    pub fn spawn<S>(store: Arc<S>, capacity: usize) -> Self
    where
        S: WindowStore + ?Sized + 'static,
    {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let counters = Arc::new(Counters::default());

        debug!(capacity = capacity.max(1), "Starting cleanup worker");
        let handle = tokio::spawn(run_worker(store, receiver, counters.clone()));

        Self {
            sender,
            counters,
            worker: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// Queue a job without waiting.
    ///
    /// Jobs with no keys are ignored. Returns `false` when the job was
    /// dropped because the queue is full or the worker has stopped. A job
    /// for which this returns `true` is always run, also across a shutdown.
    pub fn schedule(&self, job: CleanupJob) -> bool {
        if job.keys.is_empty() {
            return true;
        }

        match self.sender.try_send(Command::Cleanup(job)) {
            Ok(()) => true,
            Err(_) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Wait until every job queued before this call has been processed.
    ///
    /// Returns immediately if the worker has stopped.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.sender.send(Command::Flush(ack)).await.is_ok() {
            let _ = done.await;
        }
    }

    /// Snapshot of the worker counters.
    pub fn stats(&self) -> CleanupStats {
        CleanupStats {
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Close the queue, run every job it already holds, then wait for the
    /// worker to exit.
    ///
    /// Jobs scheduled once the queue is closed are dropped. Calling this
    /// more than once is harmless.
    pub async fn shutdown(&self) {
        // A failed send means the worker already closed the queue.
        let _ = self.sender.send(Command::Shutdown).await;

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
            debug!("Cleanup worker stopped");
        }
    }
}

async fn run_worker<S>(
    store: Arc<S>,
    mut receiver: mpsc::Receiver<Command>,
    counters: Arc<Counters>,
) where
    S: WindowStore + ?Sized,
{
    // After close() the receiver still yields buffered commands, then None.
    while let Some(command) = receiver.recv().await {
        match command {
            Command::Cleanup(job) => {
                match store.cleanup(&job.keys, job.expiration, job.now).await {
                    Ok(()) => {
                        trace!(keys = job.keys.len(), now = job.now, "Cleanup applied");
                        counters.completed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(_) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            Command::Flush(ack) => {
                let _ = ack.send(());
            }
            Command::Shutdown => {
                debug!("Draining cleanup queue");
                receiver.close();
            }
        }
    }
}
