//! Error types for the job registry

use crate::JobId;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Job {0} is no longer accepting updates")]
    ActorStopped(JobId),
}
