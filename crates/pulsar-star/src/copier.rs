//! The copy operation performed for every dequeued path.
//!
//! The drain loop only knows the [`FileCopier`] seam. [`LocalCopier`] copies
//! through the local filesystem (source and destination are expected to be
//! mounted on every Star); [`DryRunCopier`] only reports what would be copied.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum CopyError {
    #[error("{path} is not under the job source root {root}")]
    OutsideRoot { path: PathBuf, root: PathBuf },

    #[error("{path} does not name a file below the job source root")]
    UnsafePath { path: PathBuf },

    #[error("Failed to create {dir}: {source}")]
    CreateDir {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to copy {from} to {to}: {source}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Copies one file. Returns the number of bytes written.
#[async_trait]
pub trait FileCopier: Send + Sync + 'static {
    async fn copy_file(&self, source: &Path, target: &Path) -> Result<u64, CopyError>;
}

/// Maps a source path under `src_root` to the same relative path under `dst_root`.
///
/// The relative part may only hold plain names, so the target never leaves
/// `dst_root`.
pub fn target_path(src_root: &Path, dst_root: &Path, source: &Path) -> Result<PathBuf, CopyError> {
    let relative = source
        .strip_prefix(src_root)
        .map_err(|_| CopyError::OutsideRoot {
            path: source.to_path_buf(),
            root: src_root.to_path_buf(),
        })?;

    let mut components = relative.components().peekable();
    if components.peek().is_none() || !components.all(|c| matches!(c, Component::Normal(_))) {
        return Err(CopyError::UnsafePath {
            path: source.to_path_buf(),
        });
    }
    Ok(dst_root.join(relative))
}

/// Copies with `tokio::fs`, creating parent directories as needed.
#[derive(Debug, Clone, Default)]
pub struct LocalCopier;

#[async_trait]
impl FileCopier for LocalCopier {
    async fn copy_file(&self, source: &Path, target: &Path) -> Result<u64, CopyError> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| CopyError::CreateDir {
                    dir: parent.to_path_buf(),
                    source,
                })?;
        }

        tokio::fs::copy(source, target)
            .await
            .map_err(|e| CopyError::Copy {
                from: source.to_path_buf(),
                to: target.to_path_buf(),
                source: e,
            })
    }
}

/// Logs each copy and touches nothing.
#[derive(Debug, Clone, Default)]
pub struct DryRunCopier;

#[async_trait]
impl FileCopier for DryRunCopier {
    async fn copy_file(&self, source: &Path, target: &Path) -> Result<u64, CopyError> {
        let len = tokio::fs::symlink_metadata(source)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        debug!(from = %source.display(), to = %target.display(), len, "Dry run: would copy");
        Ok(len)
    }
}
