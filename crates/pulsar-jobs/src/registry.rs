//! JobRegistry: the authoritative table of jobs on one Star
//!
//! # Single writer per job
//!
//! Every job is owned by a small actor task. Mutations and snapshot requests
//! travel through the job's command queue and are applied one at a time, so
//! a snapshot always reflects every mutation sent before it.
//!
//! ```text
//! Distributor ──┐
//!               ├──► JobHandle (mpsc) ──► job actor (owns Job)
//! cancel_job ───┤                              │
//! get_status ───┘◄──────── oneshot snapshot ───┘
//! ```
//!
//! The map itself sits behind an async `RwLock`; it is only write-locked to
//! insert or purge jobs.

use crate::{Job, JobError, JobId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Commands queued per job actor
const COMMAND_CAPACITY: usize = 1024;

#[derive(Debug)]
enum JobCommand {
    Prepare,
    Start,
    Progress { bytes: u64 },
    SkippedDir,
    SkippedFile,
    Finish,
    Fail { reason: String },
    Cancel,
    Snapshot { reply: oneshot::Sender<Job> },
}

#[derive(Debug, Clone)]
struct JobHandle {
    commands: mpsc::Sender<JobCommand>,
    cancel: CancellationToken,
}

/// Registry of jobs created on this Star.
///
/// Construct one at startup and share it (`Arc<JobRegistry>`) with every
/// component that reports into jobs.
#[derive(Debug)]
pub struct JobRegistry {
    next_id: AtomicU64,
    jobs: RwLock<HashMap<JobId, JobHandle>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            jobs: RwLock::new(HashMap::new()),
        }
    }

    /// Allocates the next id and registers a Waiting job. Never fails.
    pub async fn create(
        &self,
        user: impl Into<String>,
        src: impl Into<PathBuf>,
        dst: impl Into<PathBuf>,
    ) -> JobId {
        let job_id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let job = Job::new(job_id, user, src, dst);

        let (commands, rx) = mpsc::channel(COMMAND_CAPACITY);
        tokio::spawn(run_job_actor(job, rx));

        let handle = JobHandle {
            commands,
            cancel: CancellationToken::new(),
        };
        self.jobs.write().await.insert(job_id, handle);

        debug!(job_id, "Job registered");
        job_id
    }

    pub async fn prepare(&self, job_id: JobId) -> Result<(), JobError> {
        self.send(job_id, JobCommand::Prepare).await
    }

    /// Marks the job Running and records the start time.
    ///
    /// Only the first call has an effect.
    pub async fn start(&self, job_id: JobId) -> Result<(), JobError> {
        self.send(job_id, JobCommand::Start).await
    }

    /// Counts one file of `bytes` bytes as done.
    pub async fn record_progress(&self, job_id: JobId, bytes: u64) -> Result<(), JobError> {
        self.send(job_id, JobCommand::Progress { bytes }).await
    }

    pub async fn record_skipped_dir(&self, job_id: JobId) -> Result<(), JobError> {
        self.send(job_id, JobCommand::SkippedDir).await
    }

    pub async fn record_skipped_file(&self, job_id: JobId) -> Result<(), JobError> {
        self.send(job_id, JobCommand::SkippedFile).await
    }

    /// Marks the job Completed. A no-op when the job is already terminal.
    pub async fn finish(&self, job_id: JobId) -> Result<(), JobError> {
        self.send(job_id, JobCommand::Finish).await
    }

    pub async fn fail(&self, job_id: JobId, reason: impl Into<String>) -> Result<(), JobError> {
        self.send(
            job_id,
            JobCommand::Fail {
                reason: reason.into(),
            },
        )
        .await
    }

    /// Requests cancellation and returns the job as it stands afterwards.
    ///
    /// The state change is queued before the token fires, so anyone woken by
    /// the token already sees the job Cancelled. The token fires even if the
    /// job already finished; nobody observes it at that point.
    pub async fn cancel(&self, job_id: JobId) -> Result<Job, JobError> {
        let handle = self.handle(job_id).await?;
        handle
            .commands
            .send(JobCommand::Cancel)
            .await
            .map_err(|_| JobError::ActorStopped(job_id))?;
        handle.cancel.cancel();
        self.snapshot(job_id, &handle).await
    }

    /// Token observed by the job's walker and distributor.
    pub async fn cancellation_token(&self, job_id: JobId) -> Option<CancellationToken> {
        self.jobs
            .read()
            .await
            .get(&job_id)
            .map(|handle| handle.cancel.clone())
    }

    /// Point-in-time copy of a job.
    pub async fn get(&self, job_id: JobId) -> Option<Job> {
        let handle = self.handle(job_id).await.ok()?;
        self.snapshot(job_id, &handle).await.ok()
    }

    /// Snapshots of every job, ordered by id.
    pub async fn list(&self) -> Vec<Job> {
        let mut ids: Vec<JobId> = self.jobs.read().await.keys().copied().collect();
        ids.sort_unstable();

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = self.get(id).await {
                jobs.push(job);
            }
        }
        jobs
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    /// Drops terminal jobs that finished before `before`. Returns how many were removed.
    pub async fn purge(&self, before: DateTime<Utc>) -> usize {
        let expired: Vec<JobId> = self
            .list()
            .await
            .into_iter()
            .filter(|job| {
                job.state.is_terminal() && job.finished_at.map_or(false, |t| t < before)
            })
            .map(|job| job.job_id)
            .collect();

        let mut jobs = self.jobs.write().await;
        for id in &expired {
            jobs.remove(id);
        }

        if !expired.is_empty() {
            info!(purged = expired.len(), "Purged finished jobs");
        }
        expired.len()
    }

    async fn handle(&self, job_id: JobId) -> Result<JobHandle, JobError> {
        self.jobs
            .read()
            .await
            .get(&job_id)
            .cloned()
            .ok_or(JobError::NotFound(job_id))
    }

    async fn send(&self, job_id: JobId, command: JobCommand) -> Result<(), JobError> {
        let handle = self.handle(job_id).await?;
        handle
            .commands
            .send(command)
            .await
            .map_err(|_| JobError::ActorStopped(job_id))
    }

    async fn snapshot(&self, job_id: JobId, handle: &JobHandle) -> Result<Job, JobError> {
        let (reply, rx) = oneshot::channel();
        handle
            .commands
            .send(JobCommand::Snapshot { reply })
            .await
            .map_err(|_| JobError::ActorStopped(job_id))?;
        rx.await.map_err(|_| JobError::ActorStopped(job_id))
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns one job and applies its commands in arrival order.
async fn run_job_actor(mut job: Job, mut commands: mpsc::Receiver<JobCommand>) {
    let job_id = job.job_id;

    while let Some(command) = commands.recv().await {
        match command {
            JobCommand::Prepare => {
                job.prepare();
            }
            JobCommand::Start => {
                if job.start() {
                    info!(job_id, src = %job.src.display(), "Job running");
                }
            }
            JobCommand::Progress { bytes } => job.record_progress(bytes),
            JobCommand::SkippedDir => job.record_skipped_dir(),
            JobCommand::SkippedFile => job.record_skipped_file(),
            JobCommand::Finish => {
                if job.finish() {
                    info!(
                        job_id,
                        "copied {} files with {} MB",
                        job.files_done,
                        job.bytes_done / (1024 * 1024)
                    );
                }
            }
            JobCommand::Fail { reason } => {
                if job.fail(reason) {
                    info!(job_id, error = job.error.as_deref().unwrap_or(""), "Job failed");
                }
            }
            JobCommand::Cancel => {
                if job.cancel() {
                    info!(job_id, files_done = job.files_done, "Job cancelled");
                }
            }
            JobCommand::Snapshot { reply } => {
                let _ = reply.send(job.clone());
            }
        }
    }

    debug!(job_id, "Job actor stopped");
}
