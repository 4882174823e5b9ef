/*!
 * Client subcommands: submit, status, cancel
 *
 * Each command opens one connection to a Star, makes a single call and
 * returns the text to print.
 */

use chrono::{DateTime, Utc};
use pulsar_connect::PeerClient;
use pulsar_proto::{is_error_reply, JobReport};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{PulsarError, Result};

/// Where and how the client connects.
#[derive(Debug, Clone)]
pub struct Target {
    pub server: String,
    pub connect_timeout: Duration,
}

impl Target {
    async fn connect(&self) -> Result<PeerClient> {
        debug!(server = %self.server, "Connecting");
        Ok(PeerClient::connect(&self.server, self.connect_timeout).await?)
    }
}

/// Submits a copy job. Returns the `Jobid: N` reply.
///
/// Relative paths are resolved against the working directory, since the Star
/// runs elsewhere.
pub async fn submit(target: &Target, user: &str, src: &Path, dst: &Path) -> Result<String> {
    let (src, dst) = (absolute(src)?, absolute(dst)?);
    let reply = target
        .connect()
        .await?
        .submit_job(user, src.to_string_lossy(), dst.to_string_lossy())
        .await?;

    if is_error_reply(&reply) {
        return Err(PulsarError::Rejected(reply));
    }
    Ok(reply)
}

/// Fetches a job report and renders it for the terminal.
pub async fn status(target: &Target, job_id: u64) -> Result<String> {
    let report = target.connect().await?.job_status(job_id).await?;
    Ok(render_report(&report, Utc::now()))
}

pub async fn cancel(target: &Target, job_id: u64) -> Result<String> {
    Ok(target.connect().await?.cancel_job(job_id).await?)
}

fn absolute(path: &Path) -> Result<PathBuf> {
    Ok(std::path::absolute(path)?)
}

/// Multi-line summary of a job.
pub fn render_report(report: &JobReport, now: DateTime<Utc>) -> String {
    let mut out = format!(
        "Job {} ({})\n  state:   {}\n  source:  {}\n  dest:    {}\n  done:    {} files, {}\n",
        report.job_id,
        report.user,
        report.state,
        report.src,
        report.dst,
        report.files_done,
        format_bytes(report.bytes_done),
    );

    if report.dirs_skipped > 0 {
        out.push_str(&format!("  skipped: {} directories\n", report.dirs_skipped));
    }
    if report.files_skipped > 0 {
        out.push_str(&format!("  skipped: {} files with unsendable names\n", report.files_skipped));
    }
    if let Some(ref error) = report.error {
        out.push_str(&format!("  error:   {}\n", error));
    }

    let elapsed = match (report.started_at, report.finished_at) {
        (Some(start), Some(end)) => Some(end - start),
        (Some(start), None) => Some(now - start),
        _ => None,
    };
    if let Some(elapsed) = elapsed {
        out.push_str(&format!(
            "  elapsed: {:.1}s\n",
            elapsed.num_milliseconds().max(0) as f64 / 1000.0
        ));
    }

    out.push_str(&format!(
        "  submitted {}",
        report.submitted_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    out
}

/// Format bytes into human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}
