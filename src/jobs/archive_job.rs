use std::time::Duration;

use tracing::{error, info, info_span, warn, Instrument};

use super::runner::WorkerSlot;
use super::ArchiveRequest;
use crate::archiver::{ArchiveOutcome, ArchiveService, ArchiveSummary};
use crate::config::Config;
use crate::db::{get_archive_for_bookmark, get_bookmark, set_archive_status, ArchiveStatus};
use crate::error::ArchiveError;

/// How often and how long a single-bookmark job may try.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    pub timeout: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: config.retry_backoff,
            timeout: config.archive_timeout,
        }
    }
}

/// Why a job finished without archiving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The bookmark already has an archive and the job was not forced.
    AlreadyArchived,
    /// Another attempt is running and the job was not forced.
    AlreadyProcessing,
}

/// Result of a job that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Archived(ArchiveSummary),
    Skipped(SkipReason),
}

/// Archive one bookmark, retrying failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveJob {
    pub bookmark_id: i64,
    pub user_id: i64,
    pub force: bool,
}

impl ArchiveJob {
    /// Build the job for a queued request.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::BookmarkNotFound`] if the bookmark no longer exists.
    pub async fn from_request(
        service: &ArchiveService,
        request: ArchiveRequest,
    ) -> Result<Self, ArchiveError> {
        let bookmark = get_bookmark(service.db().pool(), request.bookmark_id)
            .await
            .map_err(ArchiveError::Persistence)?
            .ok_or(ArchiveError::BookmarkNotFound(request.bookmark_id))?;

        Ok(Self {
            bookmark_id: bookmark.id,
            user_id: bookmark.user_id,
            force: request.force,
        })
    }

    #[must_use]
    pub fn tags(&self) -> Vec<String> {
        vec![
            "archive".to_string(),
            format!("bookmark:{}", self.bookmark_id),
            format!("user:{}", self.user_id),
        ]
    }

    /// Run the job to completion.
    ///
    /// Retryable failures are retried up to `policy.max_attempts` times with a fixed
    /// backoff. When the job gives up the bookmark is marked `failed`.
    ///
    /// # Errors
    ///
    /// Returns the non-retryable error that stopped the job, or
    /// [`ArchiveError::ExhaustedRetries`].
    pub async fn run(
        &self,
        service: &ArchiveService,
        policy: &RetryPolicy,
    ) -> Result<JobOutcome, ArchiveError> {
        let span = info_span!(
            "archive_job",
            bookmark_id = self.bookmark_id,
            force = self.force,
            tags = %self.tags().join(",")
        );
        self.run_with_retries(service, policy, None)
            .instrument(span)
            .await
    }

    /// Like [`run`](Self::run), but gives `slot` back to the pool while waiting out a
    /// backoff so other jobs can use it.
    pub(crate) async fn run_on_worker(
        &self,
        service: &ArchiveService,
        policy: &RetryPolicy,
        slot: &mut WorkerSlot,
    ) -> Result<JobOutcome, ArchiveError> {
        let span = info_span!(
            "archive_job",
            bookmark_id = self.bookmark_id,
            force = self.force,
            tags = %self.tags().join(",")
        );
        self.run_with_retries(service, policy, Some(slot))
            .instrument(span)
            .await
    }

    async fn run_with_retries(
        &self,
        service: &ArchiveService,
        policy: &RetryPolicy,
        mut slot: Option<&mut WorkerSlot>,
    ) -> Result<JobOutcome, ArchiveError> {
        let mut last_error = String::new();

        for attempt in 1..=policy.max_attempts {
            match self.attempt(service, policy).await {
                Ok(outcome) => {
                    if let JobOutcome::Skipped(reason) = &outcome {
                        info!(?reason, "Archive job skipped");
                    }
                    return Ok(outcome);
                }
                Err(e) if !e.is_retryable() => {
                    self.failed(service, &e).await;
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        attempt,
                        max_attempts = policy.max_attempts,
                        error = %e,
                        "Archive attempt failed"
                    );
                    last_error = e.to_string();
                    if attempt < policy.max_attempts {
                        if let Some(slot) = slot.as_mut() {
                            slot.release();
                        }
                        tokio::time::sleep(policy.backoff).await;
                        if let Some(slot) = slot.as_mut() {
                            slot.reacquire().await;
                        }
                    }
                }
            }
        }

        let err = ArchiveError::ExhaustedRetries {
            attempts: policy.max_attempts,
            last_error,
        };
        self.failed(service, &err).await;
        Err(err)
    }

    async fn attempt(
        &self,
        service: &ArchiveService,
        policy: &RetryPolicy,
    ) -> Result<JobOutcome, ArchiveError> {
        if let Some(reason) = self.skip_reason(service).await? {
            return Ok(JobOutcome::Skipped(reason));
        }

        let run = async {
            if self.force {
                service.re_archive(self.bookmark_id).await
            } else {
                service.archive(self.bookmark_id).await
            }
        };

        match tokio::time::timeout(policy.timeout, run).await {
            Ok(Ok(ArchiveOutcome::Archived(summary))) => Ok(JobOutcome::Archived(summary)),
            Ok(Ok(ArchiveOutcome::AlreadyProcessing { .. })) => {
                Ok(JobOutcome::Skipped(SkipReason::AlreadyProcessing))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                service.abandon(self.bookmark_id).await;
                Err(ArchiveError::Timeout(policy.timeout))
            }
        }
    }

    /// Reload the bookmark and decide whether this job should run at all.
    async fn skip_reason(&self, service: &ArchiveService) -> Result<Option<SkipReason>, ArchiveError> {
        let pool = service.db().pool();
        let bookmark = get_bookmark(pool, self.bookmark_id)
            .await
            .map_err(ArchiveError::Persistence)?
            .ok_or(ArchiveError::BookmarkNotFound(self.bookmark_id))?;

        if self.force {
            return Ok(None);
        }

        match bookmark.status() {
            ArchiveStatus::Processing => Ok(Some(SkipReason::AlreadyProcessing)),
            ArchiveStatus::Completed => Ok(Some(SkipReason::AlreadyArchived)),
            _ => {
                let has_archive = get_archive_for_bookmark(pool, self.bookmark_id)
                    .await
                    .map_err(ArchiveError::Persistence)?
                    .is_some();
                if !has_archive {
                    return Ok(None);
                }
                // Status drifted from the committed archive; put it back.
                set_archive_status(pool, self.bookmark_id, ArchiveStatus::Completed)
                    .await
                    .map_err(ArchiveError::Persistence)?;
                Ok(Some(SkipReason::AlreadyArchived))
            }
        }
    }

    /// Terminal failure: mark the bookmark failed and report it.
    async fn failed(&self, service: &ArchiveService, error: &ArchiveError) {
        error!(error = %error, "Archive job failed permanently");

        if matches!(error, ArchiveError::BookmarkNotFound(_)) {
            return;
        }
        if let Err(e) =
            set_archive_status(service.db().pool(), self.bookmark_id, ArchiveStatus::Failed).await
        {
            error!(error = %format!("{e:#}"), "Failed to mark bookmark failed");
        }
    }
}
