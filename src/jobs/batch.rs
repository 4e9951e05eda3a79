use anyhow::Result;
use tracing::{info, warn};

use super::{ArchiveRequest, Job, JobQueue};
use crate::db::{
    get_user_bookmarks_by_ids, mark_pending, set_archive_status, ArchiveStatus, Database,
};

/// Fan a set of a user's bookmarks out into one [`ArchiveRequest`] each.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchArchiveJob {
    pub bookmark_ids: Vec<i64>,
    pub user_id: i64,
    pub force: bool,
}

/// Which bookmarks a batch handed to the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchDispatch {
    pub dispatched: Vec<i64>,
    /// Requested but not dispatched: not owned by the user, already archived or in progress
    /// (unforced batches only), or rejected by the queue.
    pub skipped: Vec<i64>,
}

impl BatchArchiveJob {
    #[must_use]
    pub fn tags(&self) -> Vec<String> {
        vec!["batch_archive".to_string(), format!("user:{}", self.user_id)]
    }

    /// Mark the user's bookmarks `pending` and submit one request per bookmark.
    ///
    /// Extraction happens in the submitted jobs. A bookmark the queue refuses is marked
    /// `failed` and skipped; the others are still dispatched.
    ///
    /// # Errors
    ///
    /// Returns an error if the bookmarks cannot be loaded or marked pending.
    pub async fn dispatch(&self, db: &Database, queue: &dyn JobQueue) -> Result<BatchDispatch> {
        let owned = get_user_bookmarks_by_ids(db.pool(), self.user_id, &self.bookmark_ids).await?;

        let candidates: Vec<i64> = owned
            .iter()
            .filter(|bookmark| {
                self.force
                    || !matches!(
                        bookmark.status(),
                        ArchiveStatus::Completed | ArchiveStatus::Processing
                    )
            })
            .map(|bookmark| bookmark.id)
            .collect();

        let mut result = BatchDispatch {
            skipped: self
                .bookmark_ids
                .iter()
                .copied()
                .filter(|id| !candidates.contains(id))
                .collect(),
            ..BatchDispatch::default()
        };

        mark_pending(db.pool(), &candidates).await?;

        for bookmark_id in candidates {
            let request = ArchiveRequest {
                bookmark_id,
                force: self.force,
            };
            match queue.submit(Job::Archive(request)).await {
                Ok(()) => result.dispatched.push(bookmark_id),
                Err(e) => {
                    warn!(bookmark_id, error = %format!("{e:#}"), "Failed to dispatch archive job");
                    if let Err(e) =
                        set_archive_status(db.pool(), bookmark_id, ArchiveStatus::Failed).await
                    {
                        warn!(bookmark_id, error = %format!("{e:#}"), "Failed to mark undispatched bookmark failed");
                    }
                    result.skipped.push(bookmark_id);
                }
            }
        }

        info!(
            user_id = self.user_id,
            tags = %self.tags().join(","),
            requested = self.bookmark_ids.len(),
            dispatched = result.dispatched.len(),
            skipped = result.skipped.len(),
            "Batch archive dispatched"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags() {
        let job = BatchArchiveJob {
            bookmark_ids: vec![1, 2],
            user_id: 9,
            force: true,
        };
        assert_eq!(job.tags(), vec!["batch_archive", "user:9"]);
    }
}
