//! Ingestion queue and drain loop.
//!
//! `submit_batch` requests only append to the queue, so a burst of incoming
//! batches never waits for copying. A single drain task per Star takes
//! batches out in arrival order and runs the copier over their paths.
//!
//! ```text
//! submit_batch ──┐
//! submit_batch ──┼──► IngestQueue (FIFO) ──notify──► drain loop ──► FileCopier
//! submit_batch ──┘
//! ```
//!
//! The drain loop sleeps on a [`Notify`] rather than polling; a wake-up sent
//! while it is busy is stored and consumed on its next wait.

use futures::stream::{self, StreamExt};
use pulsar_proto::Batch;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::copier::{target_path, FileCopier};

/// Counters of the drain loop, as seen at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub batches: u64,
    pub files_copied: u64,
    pub files_failed: u64,
    pub bytes_copied: u64,
}

#[derive(Debug, Default)]
struct DrainCounters {
    batches: AtomicU64,
    files_copied: AtomicU64,
    files_failed: AtomicU64,
    bytes_copied: AtomicU64,
}

impl DrainCounters {
    fn snapshot(&self) -> DrainStats {
        DrainStats {
            batches: self.batches.load(Ordering::Relaxed),
            files_copied: self.files_copied.load(Ordering::Relaxed),
            files_failed: self.files_failed.load(Ordering::Relaxed),
            bytes_copied: self.bytes_copied.load(Ordering::Relaxed),
        }
    }
}

/// Per-Star FIFO of batches waiting to be copied.
pub struct IngestQueue {
    queue: Mutex<VecDeque<Batch>>,
    notify: Notify,
    copier: Arc<dyn FileCopier>,
    copy_concurrency: usize,
    draining: AtomicBool,
    drain_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
    counters: DrainCounters,
}

impl IngestQueue {
    /// `copy_concurrency` bounds the parallel copies within one batch (minimum 1).
    pub fn new(copier: Arc<dyn FileCopier>, copy_concurrency: usize, shutdown: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            copier,
            copy_concurrency: copy_concurrency.max(1),
            draining: AtomicBool::new(false),
            drain_task: Mutex::new(None),
            shutdown,
            counters: DrainCounters::default(),
        })
    }

    /// Appends a batch and wakes the drain loop, starting it on first use.
    pub async fn submit(self: &Arc<Self>, batch: Batch) {
        debug!(
            job_id = batch.job_id,
            origin = %batch.origin,
            paths = batch.len(),
            "Batch queued"
        );
        self.queue.lock().await.push_back(batch);
        self.notify.notify_one();
        self.ensure_draining().await;
    }

    /// Starts the drain loop unless it is already running.
    ///
    /// Returns whether this call started it.
    pub async fn ensure_draining(self: &Arc<Self>) -> bool {
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        let handle = tokio::spawn(drain_loop(self.clone()));
        *self.drain_task.lock().await = Some(handle);
        true
    }

    /// Removes the oldest batch.
    pub async fn pop(&self) -> Option<Batch> {
        self.queue.lock().await.pop_front()
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> DrainStats {
        self.counters.snapshot()
    }

    /// Copies every path of one batch.
    async fn process(&self, batch: Batch) {
        let Batch {
            job_id,
            origin,
            src_root,
            dst_root,
            paths,
        } = batch;
        let (src_root, dst_root) = (Path::new(&src_root), Path::new(&dst_root));
        let copier = &self.copier;
        let counters = &self.counters;

        let outcomes: Vec<bool> = stream::iter(paths)
            .map(|path: String| async move {
                let source = Path::new(&path);
                let result = match target_path(src_root, dst_root, source) {
                    Ok(target) => copier.copy_file(source, &target).await,
                    Err(e) => Err(e),
                };
                match result {
                    Ok(bytes) => {
                        counters.files_copied.fetch_add(1, Ordering::Relaxed);
                        counters.bytes_copied.fetch_add(bytes, Ordering::Relaxed);
                        true
                    }
                    Err(e) => {
                        counters.files_failed.fetch_add(1, Ordering::Relaxed);
                        warn!(job_id, path = %path, error = %e, "Copy failed");
                        false
                    }
                }
            })
            .buffer_unordered(self.copy_concurrency)
            .collect()
            .await;

        self.counters.batches.fetch_add(1, Ordering::Relaxed);
        let failed = outcomes.iter().filter(|ok| !**ok).count();
        debug!(
            job_id,
            origin = %origin,
            copied = outcomes.len() - failed,
            failed,
            "Batch drained"
        );
    }

    /// Stops the drain loop and waits for it.
    ///
    /// The batch being copied when this is called is finished first; batches
    /// still queued are left behind.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.drain_task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Drain loop panicked");
            }
        }
    }
}

async fn drain_loop(queue: Arc<IngestQueue>) {
    info!(concurrency = queue.copy_concurrency, "Drain loop started");

    while !queue.shutdown.is_cancelled() {
        if let Some(batch) = queue.pop().await {
            queue.process(batch).await;
            continue;
        }

        tokio::select! {
            biased;
            _ = queue.shutdown.cancelled() => break,
            _ = queue.notify.notified() => {}
        }
    }

    let pending = queue.len().await;
    let stats = queue.stats();
    info!(
        batches = stats.batches,
        files_copied = stats.files_copied,
        files_failed = stats.files_failed,
        pending,
        "Drain loop stopped"
    );
}
