//! Pulsar Star: one server of a copy fleet.
//!
//! A Star plays two roles at once:
//!
//! - **Origin** of the jobs submitted to it: a [`walker`] discovers the source
//!   tree and a [`distributor`] stripes each directory's files across the
//!   peer set with `submit_batch`.
//! - **Worker** for every origin in the fleet (itself included): incoming
//!   batches land in the [`ingest`] queue and a drain loop copies them.
//!
//! ```text
//! submit_job ─► walker ─(bounded mpsc)─► distributor ─┬─► Star A: IngestQueue ─► copier
//!                                                    ├─► Star B: IngestQueue ─► copier
//!                                                    └─► ...
//! ```

pub mod config;
pub mod copier;
pub mod distributor;
pub mod error;
pub mod ingest;
pub mod server;
pub mod walker;

pub use config::StarConfig;
pub use copier::{CopyError, DryRunCopier, FileCopier, LocalCopier};
pub use distributor::{partition, DistributionSummary, Distributor, JobContext};
pub use error::StarError;
pub use ingest::{DrainStats, IngestQueue};
pub use server::{StarImpl, StarServer};
pub use walker::{spawn_walk, WalkEntry, WalkSummary};
