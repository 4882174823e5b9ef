//! Remote call surface of a Star.
//!
//! [`StarImpl`] answers the four operations of the protocol; [`StarServer`]
//! accepts TCP connections and feeds their frames to it. Every connection is
//! served by its own task, so a slow client never blocks others.

use futures::{SinkExt, StreamExt};
use pulsar_connect::PeerManager;
use pulsar_jobs::{Job, JobError, JobId, JobRegistry, JobState};
use pulsar_proto::{
    job_accepted, job_rejected, Batch, JobReport, ProtoError, Request, Response, ServerCodec,
    BATCH_ACK,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::StarConfig;
use crate::copier::FileCopier;
use crate::distributor::{Distributor, JobContext};
use crate::error::StarError;
use crate::ingest::IngestQueue;

/// Request handling for one Star.
pub struct StarImpl {
    config: StarConfig,
    registry: Arc<JobRegistry>,
    distributor: Distributor,
    ingest: Arc<IngestQueue>,
    /// Distribution tasks of jobs submitted here
    jobs: TaskTracker,
}

impl StarImpl {
    /// Creates a Star.
    ///
    /// `origin` is the address other Stars know this one by. `shutdown` stops
    /// the drain loop once the batch in progress is copied; see also
    /// [`StarImpl::shutdown`].
    pub fn new(
        origin: impl Into<String>,
        config: StarConfig,
        peers: PeerManager,
        copier: Arc<dyn FileCopier>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let registry = Arc::new(JobRegistry::new());
        let distributor = Distributor::new(registry.clone(), peers, origin);
        let ingest = IngestQueue::new(copier, config.copy_concurrency, shutdown);
        Arc::new(Self {
            config,
            registry,
            distributor,
            ingest,
            jobs: TaskTracker::new(),
        })
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn ingest(&self) -> &Arc<IngestQueue> {
        &self.ingest
    }

    /// Accepts a job and starts it in the background.
    ///
    /// Returns `"Jobid: N"`, or `"Error: ..."` when `src` is not a readable
    /// directory. Rejected requests do not consume a job id.
    pub async fn submit_job(&self, user: &str, src: &str, dst: &str) -> String {
        match tokio::fs::metadata(src).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                warn!(user, src, "Rejected job: source is not a directory");
                return job_rejected(format!("{src} is not a directory"));
            }
            Err(e) => {
                warn!(user, src, error = %e, "Rejected job: source not accessible");
                return job_rejected(format!("cannot access {src}: {e}"));
            }
        }

        let job_id = self.registry.create(user, src, dst).await;
        info!(job_id, user, src, dst, "Job accepted");

        let ctx = JobContext {
            job_id,
            src_root: src.to_string(),
            dst_root: dst.to_string(),
        };
        let distributor = self.distributor.clone();
        let capacity = self.config.walk_channel_capacity;
        self.jobs.spawn(async move {
            let summary = distributor.run_job(ctx, capacity).await;
            debug!(
                job_id,
                batches = summary.batches,
                partitions = summary.partitions_sent,
                state = ?summary.final_state,
                "Job run ended"
            );
        });

        job_accepted(job_id)
    }

    /// Queues a batch for the drain loop. Never waits for copying.
    pub async fn submit_batch(&self, batch: Batch) -> String {
        if !batch.is_empty() {
            self.ingest.submit(batch).await;
        }
        BATCH_ACK.to_string()
    }

    pub async fn get_job_status(&self, job_id: JobId) -> Result<JobReport, JobError> {
        self.registry
            .get(job_id)
            .await
            .map(|job| report(&job))
            .ok_or(JobError::NotFound(job_id))
    }

    pub async fn cancel_job(&self, job_id: JobId) -> Result<String, JobError> {
        let job = self.registry.cancel(job_id).await?;
        Ok(match job.state {
            JobState::Cancelled => format!("Job {job_id} cancelled"),
            state => format!("Job {job_id} already {state}"),
        })
    }

    /// Stops this Star's work.
    ///
    /// Jobs still distributing are cancelled and their tasks awaited, then the
    /// drain loop finishes the batch in progress and stops.
    pub async fn shutdown(&self) {
        for job in self.registry.list().await {
            if job.state.is_terminal() {
                continue;
            }
            info!(job_id = job.job_id, "Cancelling job for shutdown");
            if let Err(e) = self.registry.cancel(job.job_id).await {
                warn!(job_id = job.job_id, error = %e, "Could not cancel job");
            }
        }
        self.jobs.close();
        self.jobs.wait().await;

        self.ingest.shutdown().await;
        info!("Star shut down");
    }

    /// Answers one request.
    pub async fn handle(&self, request: Request) -> Response {
        match request {
            Request::SubmitJob { user, src, dst } => Response::Submitted {
                reply: self.submit_job(&user, &src, &dst).await,
            },
            Request::SubmitBatch { batch } => Response::Ack {
                reply: self.submit_batch(batch).await,
            },
            Request::GetJobStatus { job_id } => match self.get_job_status(job_id).await {
                Ok(job) => Response::Status { job },
                Err(e) => Response::Error {
                    message: e.to_string(),
                },
            },
            Request::CancelJob { job_id } => match self.cancel_job(job_id).await {
                Ok(reply) => Response::Cancelled { reply },
                Err(e) => Response::Error {
                    message: e.to_string(),
                },
            },
        }
    }
}

fn report(job: &Job) -> JobReport {
    JobReport {
        job_id: job.job_id,
        user: job.user.clone(),
        src: job.src.to_string_lossy().into_owned(),
        dst: job.dst.to_string_lossy().into_owned(),
        state: job.state.to_string(),
        files_done: job.files_done,
        bytes_done: job.bytes_done,
        total_files: job.total_files,
        total_bytes: job.total_bytes,
        dirs_skipped: job.dirs_skipped,
        files_skipped: job.files_skipped,
        error: job.error.clone(),
        submitted_at: job.submitted_at,
        started_at: job.started_at,
        finished_at: job.finished_at,
    }
}

/// TCP front end of a Star.
pub struct StarServer {
    listener: TcpListener,
}

impl StarServer {
    pub async fn bind(address: &str) -> Result<Self, StarError> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| StarError::Bind {
                address: address.to_string(),
                source,
            })?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, StarError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves connections until `shutdown` fires.
    pub async fn serve(self, star: Arc<StarImpl>, shutdown: CancellationToken) -> Result<(), StarError> {
        info!(address = %self.local_addr()?, "Star listening");

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        continue;
                    }
                },
            };

            let star = star.clone();
            tokio::spawn(async move {
                handle_connection(stream, peer, star).await;
            });
        }

        info!("Star stopped accepting connections");
        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, star: Arc<StarImpl>) {
    debug!(%peer, "Connection opened");
    let mut framed = Framed::new(stream, ServerCodec::new());

    while let Some(frame) = framed.next().await {
        let response = match frame {
            Ok(request) => {
                debug!(%peer, op = request.op(), "Request");
                star.handle(request).await
            }
            Err(ProtoError::Json(e)) => {
                warn!(%peer, error = %e, "Malformed request");
                Response::Error {
                    message: format!("malformed request: {e}"),
                }
            }
            Err(e) => {
                debug!(%peer, error = %e, "Connection error");
                break;
            }
        };

        if let Err(e) = framed.send(response).await {
            error!(%peer, error = %e, "Failed to send response");
            break;
        }
    }

    debug!(%peer, "Connection closed");
}
