//! Wire protocol definitions for the Pulsar fleet.
//!
//! Every Star exposes the same small request/response surface to clients and
//! to the other Stars:
//!
//! - `submit_job`: start a tree migration (answered with `"Jobid: N"` or `"Error: ..."`)
//! - `submit_batch`: hand a list of paths to a peer's ingestion queue
//! - `get_job_status` / `cancel_job`: inspect or stop a job on its originating Star
//!
//! Messages travel as length-prefixed JSON frames, see [`codec`].

pub mod codec;
pub mod error;

pub use codec::{ClientCodec, JsonCodec, ServerCodec, MAX_FRAME_LEN};
pub use error::ProtoError;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Acknowledgement string returned by `submit_batch`.
pub const BATCH_ACK: &str = "ok";

const JOBID_PREFIX: &str = "Jobid: ";
const ERROR_PREFIX: &str = "Error: ";

/// An ordered list of file paths destined for one peer.
///
/// The roots travel with the paths so the receiving Star can map each source
/// path to its destination without knowing anything else about the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Job the paths belong to (scoped to `origin`)
    pub job_id: u64,
    /// Address of the Star that owns the job
    pub origin: String,
    /// Source root of the job
    pub src_root: String,
    /// Destination root of the job
    pub dst_root: String,
    /// Source paths, in discovery order
    pub paths: Vec<String>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Requests accepted by a Star.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    SubmitJob {
        user: String,
        src: String,
        dst: String,
    },
    SubmitBatch {
        batch: Batch,
    },
    GetJobStatus {
        job_id: u64,
    },
    CancelJob {
        job_id: u64,
    },
}

impl Request {
    /// Short operation name, used in logs.
    pub fn op(&self) -> &'static str {
        match self {
            Request::SubmitJob { .. } => "submit_job",
            Request::SubmitBatch { .. } => "submit_batch",
            Request::GetJobStatus { .. } => "get_job_status",
            Request::CancelJob { .. } => "cancel_job",
        }
    }
}

/// Responses returned by a Star, one per request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    /// Reply to `submit_job`: `"Jobid: N"` or `"Error: ..."`
    Submitted { reply: String },
    /// Reply to `submit_batch`
    Ack { reply: String },
    /// Reply to `get_job_status`
    Status { job: JobReport },
    /// Reply to `cancel_job`
    Cancelled { reply: String },
    /// Request could not be served
    Error { message: String },
}

/// Point-in-time view of a job, as reported over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: u64,
    pub user: String,
    pub src: String,
    pub dst: String,
    pub state: String,
    pub files_done: u64,
    pub bytes_done: u64,
    pub total_files: Option<u64>,
    pub total_bytes: Option<u64>,
    pub dirs_skipped: u64,
    /// Files left out because their path could not be sent
    #[serde(default)]
    pub files_skipped: u64,
    pub error: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Formats the reply for an accepted job.
pub fn job_accepted(job_id: u64) -> String {
    format!("{JOBID_PREFIX}{job_id}")
}

/// Formats the reply for a refused job.
pub fn job_rejected(reason: impl std::fmt::Display) -> String {
    format!("{ERROR_PREFIX}{reason}")
}

/// Whether a textual reply signals failure.
pub fn is_error_reply(reply: &str) -> bool {
    reply.starts_with(ERROR_PREFIX.trim_end())
}

/// Extracts the job id from a `submit_job` reply.
///
/// Returns the error message (without prefix) when the reply is an error or
/// cannot be parsed.
pub fn parse_job_reply(reply: &str) -> Result<u64, String> {
    if let Some(rest) = reply.strip_prefix(JOBID_PREFIX) {
        return rest
            .trim()
            .parse()
            .map_err(|e| format!("malformed job id {:?}: {}", rest, e));
    }
    match reply.strip_prefix(ERROR_PREFIX) {
        Some(message) => Err(message.to_string()),
        None => Err(format!("unexpected reply: {}", reply)),
    }
}
