//! Generic queue worker loop shared by the analysis and execution workers.
//!
//! Flow: claim → spawn handler with a heartbeat ticker → record outcome.
//! A worker that dies simply stops heartbeating; once the claim's
//! visibility deadline passes, any worker reclaims the job and `attempts`
//! increments, so poison payloads eventually park as failed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use finsight_core::types::{Job, JobStatus, QueueName};
use finsight_store::StoreGateway;

/// How a handler failure is recorded on the job.
#[derive(Debug)]
pub enum HandlerError {
    /// Transient — requeue with the worker's retry delay until the job's
    /// attempts are exhausted.
    Retry(String),
    /// Terminal — the job moves to `failed`.
    Fatal(String),
    /// Terminal — the job moves to `timeout`.
    Timeout(String),
}

#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: Job) -> std::result::Result<(), HandlerError>;
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub poll_interval: Duration,
    /// Claim lease length; heartbeats fire at a third of this.
    pub visibility_seconds: u64,
    pub max_concurrent: usize,
    /// Delay applied by `fail_with_retry` on a retriable failure.
    pub retry_delay_seconds: u64,
    /// Attempt ceiling passed to `fail_with_retry`.
    pub max_attempts: u32,
}

/// Long-lived consumer of one durable queue.
pub struct QueueWorker<H: JobHandler> {
    store: Arc<StoreGateway>,
    queue: QueueName,
    handler: Arc<H>,
    cfg: WorkerConfig,
}

impl<H: JobHandler> QueueWorker<H> {
    pub fn new(store: Arc<StoreGateway>, queue: QueueName, handler: Arc<H>, cfg: WorkerConfig) -> Self {
        Self {
            store,
            queue,
            handler,
            cfg,
        }
    }

    /// Main loop. Claims until `shutdown` broadcasts `true`, then drains
    /// in-flight handlers before returning.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(queue = %self.queue, worker_id = %self.cfg.worker_id, "queue worker started");
        let semaphore = Arc::new(Semaphore::new(self.cfg.max_concurrent));

        loop {
            if *shutdown.borrow() {
                break;
            }

            // A permit is held before claiming so a full worker never holds
            // a claim on a job it cannot yet execute.
            let permit = tokio::select! {
                p = semaphore.clone().acquire_owned() => p.expect("semaphore is never closed"),
                _ = shutdown.changed() => continue,
            };

            match self
                .store
                .claim_next(self.queue, &self.cfg.worker_id, self.cfg.visibility_seconds)
            {
                Ok(Some(job)) => self.spawn_handler(job, permit),
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(self.cfg.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    error!(queue = %self.queue, "claim failed: {e}");
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(self.cfg.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        // Drain: every outstanding permit is held by an in-flight handler.
        let _ = semaphore.acquire_many(self.cfg.max_concurrent as u32).await;
        info!(queue = %self.queue, worker_id = %self.cfg.worker_id, "queue worker stopped");
    }

    fn spawn_handler(&self, job: Job, permit: OwnedSemaphorePermit) {
        let store = self.store.clone();
        let handler = self.handler.clone();
        let cfg = self.cfg.clone();
        let queue = self.queue;

        tokio::spawn(async move {
            let _permit = permit;
            let job_id = job.id.clone();

            // Heartbeat ticker at a third of the lease, cancelled when the
            // handler returns. A lost claim stops the ticker — the job now
            // belongs to whichever worker reclaimed it.
            let cancel = CancellationToken::new();
            let heartbeat = {
                let store = store.clone();
                let cancel = cancel.clone();
                let job_id = job_id.clone();
                let worker_id = cfg.worker_id.clone();
                let visibility = cfg.visibility_seconds;
                let period = Duration::from_secs((visibility / 3).max(1));
                tokio::spawn(async move {
                    let mut tick = tokio::time::interval(period);
                    tick.tick().await; // consume the immediate first tick
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tick.tick() => {
                                match store.heartbeat(&job_id, &worker_id, visibility) {
                                    Ok(true) => {}
                                    Ok(false) => {
                                        warn!(job_id = %job_id, "claim lost, stopping heartbeat");
                                        break;
                                    }
                                    Err(e) => warn!(job_id = %job_id, "heartbeat failed: {e}"),
                                }
                            }
                        }
                    }
                })
            };

            let outcome = handler.handle(job).await;
            cancel.cancel();
            let _ = heartbeat.await;

            let recorded = match outcome {
                Ok(()) => store.complete_job(&job_id, JobStatus::Succeeded, None),
                Err(HandlerError::Retry(msg)) => {
                    warn!(job_id = %job_id, queue = %queue, "retriable failure: {msg}");
                    store
                        .fail_with_retry(&job_id, &msg, cfg.retry_delay_seconds, cfg.max_attempts)
                        .map(|_| ())
                }
                Err(HandlerError::Fatal(msg)) => {
                    warn!(job_id = %job_id, queue = %queue, "terminal failure: {msg}");
                    store.complete_job(&job_id, JobStatus::Failed, Some(&msg))
                }
                Err(HandlerError::Timeout(msg)) => {
                    warn!(job_id = %job_id, queue = %queue, "timed out: {msg}");
                    store.complete_job(&job_id, JobStatus::Timeout, Some(&msg))
                }
            };
            if let Err(e) = recorded {
                error!(job_id = %job_id, "failed to record job outcome: {e}");
            }
        });
    }
}
