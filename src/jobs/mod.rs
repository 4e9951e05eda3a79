//! Asynchronous entry points into the archive pipeline.
//!
//! Work arrives as [`Job`]s on a [`JobQueue`]. The in-process [`JobRunner`] is the queue the
//! binary uses; anything else that can deliver jobs at least once can stand in for it.

mod archive_job;
mod batch;
mod runner;

use anyhow::Result;
use async_trait::async_trait;

pub use archive_job::{ArchiveJob, JobOutcome, RetryPolicy, SkipReason};
pub use batch::{BatchArchiveJob, BatchDispatch};
pub use runner::{JobRunner, QueueHandle};

/// Request to archive one bookmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveRequest {
    pub bookmark_id: i64,
    /// Re-archive even if an archive exists or another attempt is running.
    pub force: bool,
}

/// A unit of queued work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    Archive(ArchiveRequest),
    Batch(BatchArchiveJob),
}

/// Where jobs are submitted.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue `job`.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue no longer accepts work.
    async fn submit(&self, job: Job) -> Result<()>;
}
