//! Distributor: turns a walk into per-peer batches.
//!
//! Entries are buffered until the walker closes a directory, then the buffer
//! is striped round-robin across the peer set and every non-empty partition
//! is sent with `submit_batch`. A partition over the configured path or byte
//! budget is sent as several consecutive calls. Partitions of one batch go
//! out concurrently; the next batch waits for all of them, so each peer sees
//! its paths in discovery order.
//!
//! Paths travel as UTF-8 strings. A file whose name is not valid UTF-8 is
//! recorded as skipped on the job and never dispatched.

use futures::future::try_join_all;
use pulsar_connect::{ConnectError, PeerClient, PeerManager};
use pulsar_jobs::{JobError, JobId, JobRegistry, JobState};
use pulsar_proto::Batch;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::walker::{spawn_walk, WalkEntry, WalkSummary};

/// Splits `paths` into `peers` partitions: partition `i` holds
/// `paths[i]`, `paths[i + peers]`, ... in discovery order.
pub fn partition(paths: Vec<String>, peers: usize) -> Vec<Vec<String>> {
    let peers = peers.max(1);
    let mut parts: Vec<Vec<String>> = (0..peers)
        .map(|i| Vec::with_capacity(paths.len().saturating_sub(i).div_ceil(peers)))
        .collect();
    for (i, path) in paths.into_iter().enumerate() {
        parts[i % peers].push(path);
    }
    parts
}

/// Cuts one peer's partition into consecutive chunks of at most `max_paths`
/// paths and `max_bytes` path bytes. A single path over `max_bytes` gets a
/// chunk of its own.
pub fn split_partition(
    paths: Vec<String>,
    max_paths: usize,
    max_bytes: usize,
) -> Vec<Vec<String>> {
    let max_paths = max_paths.max(1);
    let mut chunks = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut bytes = 0;

    for path in paths {
        if !current.is_empty() && (current.len() >= max_paths || bytes + path.len() > max_bytes) {
            chunks.push(std::mem::take(&mut current));
            bytes = 0;
        }
        bytes += path.len();
        current.push(path);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// What a job copies, as seen by its distributor.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub src_root: String,
    pub dst_root: String,
}

/// Outcome of one distribution run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DistributionSummary {
    /// Non-empty directory batches flushed
    pub batches: u64,
    /// `submit_batch` calls acknowledged by peers
    pub partitions_sent: u64,
    pub files: u64,
    pub bytes: u64,
    pub dirs_skipped: u64,
    /// Files left out because their name is not valid UTF-8
    pub files_skipped: u64,
    pub final_state: Option<JobState>,
}

/// Drives jobs of one Star through its peer set.
#[derive(Clone)]
pub struct Distributor {
    registry: Arc<JobRegistry>,
    peers: PeerManager,
    origin: String,
}

impl Distributor {
    /// `origin` identifies this Star in the batches it sends.
    pub fn new(registry: Arc<JobRegistry>, peers: PeerManager, origin: impl Into<String>) -> Self {
        Self {
            registry,
            peers,
            origin: origin.into(),
        }
    }

    /// Runs a registered job end to end: walk, distribute, wait for the walker.
    pub async fn run_job(&self, ctx: JobContext, walk_capacity: usize) -> DistributionSummary {
        let job_id = ctx.job_id;
        let Some(cancel) = self.registry.cancellation_token(job_id).await else {
            warn!(job_id, "Job vanished before it could run");
            return DistributionSummary::default();
        };
        note(job_id, self.registry.prepare(job_id).await);

        let (rx, walker) = spawn_walk(PathBuf::from(&ctx.src_root), walk_capacity, cancel.clone());
        let summary = self.run(&ctx, rx, &cancel).await;

        // The receiver is gone by now, so the walker stops at its next send.
        match walker.await {
            Ok(WalkSummary {
                dirs_listed,
                interrupted,
                ..
            }) => debug!(job_id, dirs_listed, interrupted, "Walker joined"),
            Err(e) => error!(job_id, error = %e, "Walker task panicked"),
        }
        summary
    }

    /// Consumes a walk stream for `ctx`, dispatching each directory's files.
    ///
    /// The peer set is connected before the first entry is read; if any peer
    /// is unreachable the job fails without dispatching anything.
    pub async fn run(
        &self,
        ctx: &JobContext,
        mut rx: mpsc::Receiver<WalkEntry>,
        cancel: &CancellationToken,
    ) -> DistributionSummary {
        let job_id = ctx.job_id;
        let mut summary = DistributionSummary::default();

        let clients = match self.peers.connect_all().await {
            Ok(clients) => clients,
            Err(e) => {
                self.fail(job_id, &e).await;
                summary.final_state = self.state_of(job_id).await;
                return summary;
            }
        };

        let mut buffer: Vec<String> = Vec::new();
        let mut started = false;

        loop {
            let entry = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(job_id, pending = buffer.len(), "Distribution cancelled");
                    summary.final_state = self.state_of(job_id).await;
                    return summary;
                }
                entry = rx.recv() => entry,
            };
            let Some(entry) = entry else { break };

            match entry {
                WalkEntry::File { path, size } => {
                    let path = match path.into_os_string().into_string() {
                        Ok(path) => path,
                        Err(raw) => {
                            warn!(
                                job_id,
                                path = %raw.to_string_lossy(),
                                "Skipping file whose name is not valid UTF-8"
                            );
                            summary.files_skipped += 1;
                            note(job_id, self.registry.record_skipped_file(job_id).await);
                            continue;
                        }
                    };
                    if !started {
                        note(job_id, self.registry.start(job_id).await);
                        started = true;
                    }
                    buffer.push(path);
                    summary.files += 1;
                    summary.bytes += size;
                    note(job_id, self.registry.record_progress(job_id, size).await);
                }
                WalkEntry::DirectoryDone { dir } => {
                    if buffer.is_empty() {
                        continue;
                    }
                    let paths = std::mem::take(&mut buffer);
                    debug!(job_id, dir = %dir.display(), files = paths.len(), "Flushing directory batch");
                    let sent = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            info!(job_id, dir = %dir.display(), "Distribution cancelled mid-batch");
                            summary.final_state = self.state_of(job_id).await;
                            return summary;
                        }
                        sent = self.dispatch(ctx, &clients, paths) => sent,
                    };
                    match sent {
                        Ok(sent) => {
                            summary.batches += 1;
                            summary.partitions_sent += sent;
                        }
                        Err(e) => {
                            self.fail(job_id, &e).await;
                            summary.final_state = self.state_of(job_id).await;
                            return summary;
                        }
                    }
                }
                WalkEntry::Skipped { dir, reason } => {
                    warn!(job_id, dir = %dir.display(), reason = %reason, "Directory skipped");
                    summary.dirs_skipped += 1;
                    note(job_id, self.registry.record_skipped_dir(job_id).await);
                }
            }
        }

        if !buffer.is_empty() {
            warn!(
                job_id,
                unflushed = buffer.len(),
                "Walk ended without closing its last directory; entries not dispatched"
            );
        }

        note(job_id, self.registry.finish(job_id).await);
        summary.final_state = self.state_of(job_id).await;
        summary
    }

    /// Sends one batch, returning how many `submit_batch` calls were acknowledged.
    ///
    /// Peers are served concurrently; the chunks of one peer's partition are
    /// sent one after another.
    async fn dispatch(
        &self,
        ctx: &JobContext,
        clients: &[PeerClient],
        paths: Vec<String>,
    ) -> Result<u64, ConnectError> {
        let config = self.peers.config();
        let sends = partition(paths, clients.len())
            .into_iter()
            .zip(clients)
            .filter(|(part, _)| !part.is_empty())
            .map(|(part, client)| {
                let chunks = split_partition(part, config.max_batch_paths, config.max_batch_bytes);
                async move {
                    let mut acked = 0u64;
                    for paths in chunks {
                        let batch = Batch {
                            job_id: ctx.job_id,
                            origin: self.origin.clone(),
                            src_root: ctx.src_root.clone(),
                            dst_root: ctx.dst_root.clone(),
                            paths,
                        };
                        debug!(peer = client.address(), paths = batch.len(), "submit_batch");
                        client.submit_batch(batch).await?;
                        acked += 1;
                    }
                    Ok::<_, ConnectError>(acked)
                }
            });

        let acked = try_join_all(sends).await?;
        Ok(acked.into_iter().sum())
    }

    async fn fail(&self, job_id: JobId, e: &ConnectError) {
        error!(job_id, error = %e, "Dispatch failed, abandoning job");
        note(job_id, self.registry.fail(job_id, e.to_string()).await);
    }

    async fn state_of(&self, job_id: JobId) -> Option<JobState> {
        self.registry.get(job_id).await.map(|job| job.state)
    }
}

/// Registry updates only fail when the job was purged mid-run.
fn note(job_id: JobId, result: Result<(), JobError>) {
    if let Err(e) = result {
        warn!(job_id, error = %e, "Job update dropped");
    }
}
