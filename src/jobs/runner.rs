use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ArchiveJob, ArchiveRequest, Job, JobQueue, RetryPolicy};
use crate::archiver::ArchiveService;
use crate::config::Config;
use crate::db::{get_pending_bookmark_ids, reset_stuck_processing};

/// Submission side of a [`JobRunner`].
///
/// An unforced archive request for a bookmark that is already waiting in the queue is
/// coalesced with the waiting one.
#[derive(Debug, Clone)]
pub struct QueueHandle {
    sender: mpsc::UnboundedSender<Job>,
    waiting: Arc<Mutex<HashSet<i64>>>,
}

impl QueueHandle {
    async fn mark_started(&self, bookmark_id: i64) {
        self.waiting.lock().await.remove(&bookmark_id);
    }
}

#[async_trait]
impl JobQueue for QueueHandle {
    async fn submit(&self, job: Job) -> Result<()> {
        if let Job::Archive(request) = &job {
            let newly_waiting = self.waiting.lock().await.insert(request.bookmark_id);
            if !newly_waiting && !request.force {
                debug!(bookmark_id = request.bookmark_id, "Archive already queued");
                return Ok(());
            }
        }

        self.sender
            .send(job)
            .map_err(|_| anyhow!("Job runner has shut down"))
    }
}

/// A running job's claim on one of the pool's workers.
#[derive(Debug)]
pub(crate) struct WorkerSlot {
    workers: Arc<Semaphore>,
    permit: Option<OwnedSemaphorePermit>,
}

impl WorkerSlot {
    fn new(workers: Arc<Semaphore>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            workers,
            permit: Some(permit),
        }
    }

    /// Hand the worker back to the pool.
    pub(crate) fn release(&mut self) {
        self.permit = None;
    }

    /// Wait for a free worker again after [`release`](Self::release).
    pub(crate) async fn reacquire(&mut self) {
        if self.permit.is_some() {
            return;
        }
        match Arc::clone(&self.workers).acquire_owned().await {
            Ok(permit) => self.permit = Some(permit),
            Err(e) => warn!(error = %e, "Worker pool closed, continuing without a worker slot"),
        }
    }
}

/// In-process worker pool that runs queued jobs.
///
/// At most `worker_concurrency` jobs run at once; a job waiting out a retry backoff does not
/// count. Shutting down stops new jobs from starting; jobs already running are allowed to
/// finish.
#[derive(Debug)]
pub struct JobRunner {
    queue: QueueHandle,
    service: Arc<ArchiveService>,
    shutdown: CancellationToken,
    dispatcher: JoinHandle<()>,
}

impl JobRunner {
    /// Start the dispatcher on the current runtime.
    #[must_use]
    pub fn start(service: Arc<ArchiveService>, config: &Config) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let queue = QueueHandle {
            sender,
            waiting: Arc::new(Mutex::new(HashSet::new())),
        };
        let shutdown = CancellationToken::new();

        let dispatcher = tokio::spawn(dispatch_loop(
            receiver,
            queue.clone(),
            Arc::clone(&service),
            RetryPolicy::from_config(config),
            Arc::new(Semaphore::new(config.worker_concurrency.max(1))),
            shutdown.clone(),
        ));

        info!(
            workers = config.worker_concurrency,
            max_attempts = config.max_attempts,
            "Job runner started"
        );

        Self {
            queue,
            service,
            shutdown,
            dispatcher,
        }
    }

    /// A handle for submitting jobs.
    #[must_use]
    pub fn queue(&self) -> QueueHandle {
        self.queue.clone()
    }

    /// Recover from an unclean shutdown.
    ///
    /// Bookmarks left in `processing` go back to `pending`, and every pending bookmark is
    /// queued again. Returns how many were queued.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be read or updated.
    pub async fn recover_on_startup(&self) -> Result<usize> {
        let stuck = reset_stuck_processing(self.service.db().pool()).await?;
        if !stuck.is_empty() {
            info!(count = stuck.len(), "Reset stuck processing bookmarks to pending");
        }

        self.enqueue_pending().await
    }

    /// Queue every `pending` bookmark that is not already waiting. Returns how many were
    /// found pending.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be read or the runner has shut down.
    pub async fn enqueue_pending(&self) -> Result<usize> {
        let pending = get_pending_bookmark_ids(self.service.db().pool()).await?;
        for &bookmark_id in &pending {
            self.queue
                .submit(Job::Archive(ArchiveRequest {
                    bookmark_id,
                    force: false,
                }))
                .await?;
        }
        if !pending.is_empty() {
            debug!(count = pending.len(), "Queued pending bookmarks");
        }

        Ok(pending.len())
    }

    /// Stop starting new jobs and wait for running ones to finish. Queued jobs are dropped.
    pub async fn shutdown(self) {
        info!("Job runner shutting down");
        self.shutdown.cancel();
        if let Err(e) = self.dispatcher.await {
            error!("Job dispatcher panicked: {e}");
        }
    }
}

async fn dispatch_loop(
    mut receiver: mpsc::UnboundedReceiver<Job>,
    queue: QueueHandle,
    service: Arc<ArchiveService>,
    policy: RetryPolicy,
    workers: Arc<Semaphore>,
    shutdown: CancellationToken,
) {
    let mut running = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            Some(finished) = running.join_next(), if !running.is_empty() => {
                if let Err(e) = finished {
                    error!("Job task panicked: {e}");
                }
                let pruned = service.host_limiter().prune_idle().await;
                if pruned > 0 {
                    debug!(pruned, "Dropped idle host limits");
                }
            }
            job = receiver.recv() => {
                let Some(job) = job else { break };
                if let Job::Archive(request) = &job {
                    queue.mark_started(request.bookmark_id).await;
                }
                let permit = tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break,
                    permit = Arc::clone(&workers).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                let service = Arc::clone(&service);
                let queue = queue.clone();
                let mut slot = WorkerSlot::new(Arc::clone(&workers), permit);
                running.spawn(async move {
                    run_job(job, &service, &policy, &queue, &mut slot).await;
                });
            }
        }
    }

    receiver.close();
    let dropped = std::iter::from_fn(|| receiver.try_recv().ok()).count();
    if dropped > 0 {
        warn!(dropped, "Dropped queued jobs at shutdown");
    }

    while let Some(finished) = running.join_next().await {
        if let Err(e) = finished {
            error!("Job task panicked: {e}");
        }
    }
    debug!("Job dispatcher stopped");
}

async fn run_job(
    job: Job,
    service: &ArchiveService,
    policy: &RetryPolicy,
    queue: &QueueHandle,
    slot: &mut WorkerSlot,
) {
    match job {
        Job::Archive(request) => {
            let job = match ArchiveJob::from_request(service, request).await {
                Ok(job) => job,
                Err(e) => {
                    warn!(bookmark_id = request.bookmark_id, error = %e, "Dropping archive job");
                    return;
                }
            };
            // Outcomes and failures are logged by the job itself.
            let _ = job.run_on_worker(service, policy, slot).await;
        }
        Job::Batch(batch) => {
            if let Err(e) = batch.dispatch(service.db(), queue).await {
                error!(user_id = batch.user_id, error = %format!("{e:#}"), "Batch archive dispatch failed");
            }
        }
    }
}
