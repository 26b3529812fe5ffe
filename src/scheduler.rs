// src/scheduler.rs
//! Poll closure scheduling.
//!
//! `ClosureScheduler` is the client side handed to the lifecycle controller:
//! it registers and cancels one keyed job per poll. `ClosureWorker` is the
//! consumer side: it claims due jobs, runs the closure handler and applies
//! the retry policy.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{PollError, StoreError};
use crate::queue::{JobQueue, JobRecord};

/// Backoff and attempt ceiling for closure jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::seconds(2),
            max_delay: Duration::minutes(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next delivery after `attempt` failed (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let factor = 1i32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

/// Deterministic job key: one live job per poll.
pub fn job_key(poll_id: Uuid) -> String {
    format!("close-poll:{poll_id}")
}

pub struct ClosureScheduler {
    queue: Arc<dyn JobQueue>,
}

impl ClosureScheduler {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self { queue }
    }

    /// Register the closure of `poll_id` at `fire_at`. A past `fire_at` is
    /// clamped to now so an overdue poll closes on the next worker tick.
    pub async fn schedule(&self, poll_id: Uuid, fire_at: DateTime<Utc>) -> Result<(), StoreError> {
        let run_at = fire_at.max(Utc::now());
        self.queue.enqueue(&job_key(poll_id), poll_id, run_at).await?;
        debug!(%poll_id, %run_at, "closure scheduled");
        Ok(())
    }

    /// Drop the pending closure of `poll_id`. A missing job is not an error.
    pub async fn cancel(&self, poll_id: Uuid) -> Result<(), StoreError> {
        if self.queue.cancel(&job_key(poll_id)).await? {
            debug!(%poll_id, "closure cancelled");
        }
        Ok(())
    }
}

/// Work performed when a closure job fires.
#[async_trait]
pub trait ClosureHandler: Send + Sync {
    async fn run_closure(&self, poll_id: Uuid) -> Result<(), PollError>;
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub poll_interval: StdDuration,
    pub lease: Duration,
    pub batch_size: u32,
    pub retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: StdDuration::from_secs(5),
            lease: Duration::seconds(60),
            batch_size: 32,
            retry: RetryPolicy::default(),
        }
    }
}

/// What happened to one claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    Completed,
    Retrying { attempt: u32, retry_at: DateTime<Utc> },
    Abandoned { attempt: u32 },
}

pub struct ClosureWorker {
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn ClosureHandler>,
    config: WorkerConfig,
}

impl ClosureWorker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        handler: Arc<dyn ClosureHandler>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            handler,
            config,
        }
    }

    /// Claim and run every job due at `now`.
    ///
    /// A queue failure while settling one job is logged and the rest of the
    /// batch still runs; the unsettled job comes back once its lease lapses.
    /// Only a failed claim is returned as an error.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<Vec<(Uuid, JobResult)>, StoreError> {
        let jobs = self
            .queue
            .claim_due(now, self.config.lease, self.config.batch_size)
            .await?;
        let mut results = Vec::with_capacity(jobs.len());
        for job in jobs {
            let poll_id = job.poll_id;
            let attempt = job.attempts;
            match self.run_job(job, now).await {
                Ok(result) => results.push((poll_id, result)),
                Err(e) => warn!(
                    %poll_id,
                    attempt,
                    error = %e,
                    "could not settle closure job, it will be redelivered after its lease"
                ),
            }
        }
        Ok(results)
    }

    async fn run_job(&self, job: JobRecord, now: DateTime<Utc>) -> Result<JobResult, StoreError> {
        let poll_id = job.poll_id;
        let attempt = job.attempts;

        let err = match self.handler.run_closure(poll_id).await {
            Ok(()) => {
                self.queue.complete(&job.job_key).await?;
                return Ok(JobResult::Completed);
            }
            Err(err) => err,
        };

        if !err.is_retryable() {
            // Nothing a retry can change; the poll stays as it is.
            warn!(%poll_id, attempt, error = %err, "closure job failed permanently");
            self.queue.abandon(&job.job_key, &err.to_string()).await?;
            return Ok(JobResult::Abandoned { attempt });
        }

        if attempt >= self.config.retry.max_attempts {
            error!(
                %poll_id,
                attempt,
                error = %err,
                "closure job exhausted its retries; poll is stuck open and needs an operator"
            );
            self.queue.abandon(&job.job_key, &err.to_string()).await?;
            return Ok(JobResult::Abandoned { attempt });
        }

        let retry_at = now + self.config.retry.backoff(attempt);
        warn!(%poll_id, attempt, %retry_at, error = %err, "closure job failed, will retry");
        self.queue
            .retry_at(&job.job_key, retry_at, &err.to_string())
            .await?;
        Ok(JobResult::Retrying { attempt, retry_at })
    }

    /// Tick until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.poll_interval.as_secs(),
            "closure worker started"
        );
        let mut interval = tokio::time::interval(self.config.poll_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_due(Utc::now()).await {
                        warn!(error = %e, "closure worker tick failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("closure worker stopped");
    }
}

/// Spawn the worker loop as a background tokio task.
pub fn spawn_closure_worker(
    worker: ClosureWorker,
    shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(worker.run(shutdown))
}
