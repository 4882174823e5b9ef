//! Star settings, read from the `[server]` section of the config file.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::copier::{DryRunCopier, FileCopier, LocalCopier};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StarConfig {
    /// Interface to listen on
    pub bind: String,
    pub port: u16,
    /// Entries buffered between a job's walker and its distributor
    pub walk_channel_capacity: usize,
    /// Parallel copies within one dequeued batch
    pub copy_concurrency: usize,
    /// Log copies instead of performing them
    pub dry_run: bool,
}

impl Default for StarConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 1234,
            walk_channel_capacity: 1000,
            copy_concurrency: 1,
            dry_run: false,
        }
    }
}

impl StarConfig {
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// The copier this Star's drain loop should use.
    pub fn copier(&self) -> Arc<dyn FileCopier> {
        if self.dry_run {
            Arc::new(DryRunCopier)
        } else {
            Arc::new(LocalCopier)
        }
    }
}
