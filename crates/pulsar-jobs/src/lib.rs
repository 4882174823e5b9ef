//! Pulsar Jobs: lifecycle and bookkeeping for tree migration jobs
//!
//! # Overview
//!
//! A [`Job`] is one "copy this directory tree" request together with its
//! progress counters. Jobs live in a [`JobRegistry`], which hands out
//! monotonically increasing ids and routes every mutation of a job through a
//! single-writer actor, so counters, timestamps and state always change
//! together.
//!
//! # Lifecycle
//!
//! ```text
//! Waiting ──► Preparing ──► Running ──► Completed
//!    │            │            ├──────► Failed
//!    └────────────┴────────────┴──────► Cancelled
//! ```
//!
//! Terminal states never change again; repeated terminal requests are no-ops.
//!
//! # Example
//!
//! ```no_run
//! use pulsar_jobs::{JobRegistry, JobState};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = JobRegistry::new();
//!     let id = registry.create("alice", "/data/src", "/data/dst").await;
//!
//!     registry.start(id).await?;
//!     registry.record_progress(id, 4096).await?;
//!     registry.finish(id).await?;
//!
//!     let job = registry.get(id).await.unwrap();
//!     assert_eq!(job.state, JobState::Completed);
//!     Ok(())
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

pub mod error;
pub mod registry;

pub use error::JobError;
pub use registry::JobRegistry;

/// Job identifier, unique per originating Star for its lifetime.
pub type JobId = u64;

/// Job lifecycle state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Accepted, nothing scheduled yet
    Waiting,
    /// Walker and distributor launched, no file seen yet
    Preparing,
    /// At least one file has been dispatched
    Running,
    /// Discovery finished and every batch was dispatched
    Completed,
    /// Dispatch failed for good
    Failed,
    /// Stopped on request
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Waiting => write!(f, "waiting"),
            JobState::Preparing => write!(f, "preparing"),
            JobState::Running => write!(f, "running"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
            JobState::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for JobState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "waiting" => Ok(JobState::Waiting),
            "preparing" => Ok(JobState::Preparing),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "cancelled" => Ok(JobState::Cancelled),
            _ => Err(anyhow::anyhow!("Invalid job state: {}", s)),
        }
    }
}

/// One tree migration request and its progress.
///
/// `files_done`/`bytes_done` count entries handed to peers. The totals stay
/// `None` until discovery has finished, after which `files_done <= total_files`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub job_id: JobId,
    pub user: String,
    pub src: PathBuf,
    pub dst: PathBuf,
    pub total_files: Option<u64>,
    pub total_bytes: Option<u64>,
    pub files_done: u64,
    pub bytes_done: u64,
    /// Directories that could not be listed
    pub dirs_skipped: u64,
    /// Files discovered but never handed to a peer
    pub files_skipped: u64,
    pub state: JobState,
    /// Reason for `Failed`
    pub error: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        job_id: JobId,
        user: impl Into<String>,
        src: impl Into<PathBuf>,
        dst: impl Into<PathBuf>,
    ) -> Self {
        Self {
            job_id,
            user: user.into(),
            src: src.into(),
            dst: dst.into(),
            total_files: None,
            total_bytes: None,
            files_done: 0,
            bytes_done: 0,
            dirs_skipped: 0,
            files_skipped: 0,
            state: JobState::Waiting,
            error: None,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Waiting → Preparing. Returns whether the state changed.
    pub fn prepare(&mut self) -> bool {
        if self.state != JobState::Waiting {
            return false;
        }
        self.state = JobState::Preparing;
        true
    }

    /// Enters Running and stamps the start time, once.
    pub fn start(&mut self) -> bool {
        if !matches!(self.state, JobState::Waiting | JobState::Preparing) {
            return false;
        }
        self.state = JobState::Running;
        self.started_at = Some(Utc::now());
        true
    }

    /// Counts one more file of `bytes` bytes.
    pub fn record_progress(&mut self, bytes: u64) {
        if self.state.is_terminal() {
            return;
        }
        self.files_done += 1;
        self.bytes_done += bytes;
    }

    pub fn record_skipped_dir(&mut self) {
        if !self.state.is_terminal() {
            self.dirs_skipped += 1;
        }
    }

    /// Counts a file left out of the job. It does not count as done.
    pub fn record_skipped_file(&mut self) {
        if !self.state.is_terminal() {
            self.files_skipped += 1;
        }
    }

    /// Marks the job Completed. The totals become known at this point.
    pub fn finish(&mut self) -> bool {
        if !self.close(JobState::Completed) {
            return false;
        }
        self.total_files = Some(self.files_done);
        self.total_bytes = Some(self.bytes_done);
        true
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        if !self.close(JobState::Failed) {
            return false;
        }
        self.error = Some(reason.into());
        true
    }

    pub fn cancel(&mut self) -> bool {
        self.close(JobState::Cancelled)
    }

    fn close(&mut self, state: JobState) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = state;
        self.finished_at = Some(Utc::now());
        true
    }
}
