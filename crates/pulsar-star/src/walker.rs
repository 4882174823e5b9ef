//! Tree walker: depth-first discovery feeding a distributor.
//!
//! For every directory the walker emits all of its files, then exactly one
//! [`WalkEntry::DirectoryDone`], and only then descends into the
//! subdirectories in listing order. Files of a directory can therefore be
//! copying while the walk continues below it.
//!
//! The walk is a plain recursive function running on the blocking pool; the
//! bounded channel to the distributor suspends it when dispatch falls behind.

use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One item of the walker's output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkEntry {
    /// A non-directory entry (regular file or symlink)
    File { path: PathBuf, size: u64 },
    /// Every file of `dir` has been emitted
    DirectoryDone { dir: PathBuf },
    /// `dir` could not be listed and was left out
    Skipped { dir: PathBuf, reason: String },
}

/// Totals of one walk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalkSummary {
    pub dirs_listed: u64,
    pub dirs_skipped: u64,
    pub files: u64,
    pub bytes: u64,
    /// The walk stopped early (cancelled or the consumer went away)
    pub interrupted: bool,
}

/// Why a walk stopped before finishing.
enum Halt {
    Cancelled,
    ConsumerGone,
}

/// Starts walking `root` on the blocking pool.
///
/// Returns the receiving end of a channel holding at most `capacity` entries.
/// The channel closes when the walk is over, which is the only signal that
/// discovery is complete.
pub fn spawn_walk(
    root: PathBuf,
    capacity: usize,
    cancel: CancellationToken,
) -> (mpsc::Receiver<WalkEntry>, JoinHandle<WalkSummary>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let handle = tokio::task::spawn_blocking(move || walk(&root, &tx, &cancel));
    (rx, handle)
}

/// Walks `root` synchronously, sending entries into `tx`.
///
/// Must not be called from an async context (it uses blocking sends).
pub fn walk(root: &Path, tx: &mpsc::Sender<WalkEntry>, cancel: &CancellationToken) -> WalkSummary {
    let mut summary = WalkSummary::default();

    match walk_dir(root, tx, cancel, &mut summary) {
        Ok(()) => debug!(
            root = %root.display(),
            dirs = summary.dirs_listed,
            files = summary.files,
            bytes = summary.bytes,
            "Walk complete"
        ),
        Err(Halt::Cancelled) => {
            summary.interrupted = true;
            debug!(root = %root.display(), "Walk cancelled");
        }
        Err(Halt::ConsumerGone) => {
            summary.interrupted = true;
            debug!(root = %root.display(), "Walk stopped, distributor went away");
        }
    }
    summary
}

fn walk_dir(
    dir: &Path,
    tx: &mpsc::Sender<WalkEntry>,
    cancel: &CancellationToken,
    summary: &mut WalkSummary,
) -> Result<(), Halt> {
    if cancel.is_cancelled() {
        return Err(Halt::Cancelled);
    }

    let (files, subdirs) = match list_dir(dir) {
        Ok(listing) => listing,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Skipping unreadable directory");
            summary.dirs_skipped += 1;
            return send(
                tx,
                WalkEntry::Skipped {
                    dir: dir.to_path_buf(),
                    reason: e.to_string(),
                },
            );
        }
    };
    summary.dirs_listed += 1;

    for (path, size) in files {
        summary.files += 1;
        summary.bytes += size;
        send(tx, WalkEntry::File { path, size })?;
    }
    send(
        tx,
        WalkEntry::DirectoryDone {
            dir: dir.to_path_buf(),
        },
    )?;

    for subdir in subdirs {
        walk_dir(&subdir, tx, cancel, summary)?;
    }
    Ok(())
}

/// Lists one directory, splitting files from subdirectories.
///
/// `read_dir` pulls entries from the OS in chunks; iterating it to the end
/// covers directories of any size. Symlinks are not followed.
fn list_dir(dir: &Path) -> std::io::Result<(Vec<(PathBuf, u64)>, Vec<PathBuf>)> {
    let mut files = Vec::new();
    let mut subdirs = Vec::new();

    for entry in fs::read_dir(dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Unreadable directory entry");
                continue;
            }
        };
        let file_type = match entry.file_type() {
            Ok(ft) => ft,
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "Cannot stat entry");
                continue;
            }
        };

        if file_type.is_dir() {
            subdirs.push(entry.path());
        } else {
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            files.push((entry.path(), size));
        }
    }

    Ok((files, subdirs))
}

fn send(tx: &mpsc::Sender<WalkEntry>, entry: WalkEntry) -> Result<(), Halt> {
    tx.blocking_send(entry).map_err(|_| Halt::ConsumerGone)
}
