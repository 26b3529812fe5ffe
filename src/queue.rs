// src/queue.rs
//! Durable delayed-job storage behind the closure scheduler.
//!
//! Jobs are keyed: enqueueing an existing key replaces it, so one poll never
//! has two live jobs. Claiming a job pushes its `run_at` forward by a lease
//! instead of removing it; a worker that dies mid-job leaves the job to be
//! claimed again once the lease runs out (at-least-once delivery).

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Abandoned,
}

impl JobState {
    fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Abandoned => "abandoned",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub job_key: String,
    pub poll_id: Uuid,
    pub run_at: DateTime<Utc>,
    /// Deliveries so far, including the current one once claimed.
    pub attempts: u32,
    pub state: JobState,
    pub last_error: Option<String>,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Insert or replace the job under `job_key`, resetting its attempts.
    async fn enqueue(&self, job_key: &str, poll_id: Uuid, run_at: DateTime<Utc>)
        -> Result<(), StoreError>;

    /// Remove the job. Returns `false` if there was none.
    async fn cancel(&self, job_key: &str) -> Result<bool, StoreError>;

    /// Claim up to `limit` pending jobs due at `now`, bumping their attempt
    /// count and hiding them until `now + lease`.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: u32,
    ) -> Result<Vec<JobRecord>, StoreError>;

    /// The job ran to completion; forget it.
    async fn complete(&self, job_key: &str) -> Result<(), StoreError>;

    /// Make the job due again at `retry_at`, keeping its attempt count.
    async fn retry_at(
        &self,
        job_key: &str,
        retry_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError>;

    /// Park the job for operator attention; it is never claimed again.
    async fn abandon(&self, job_key: &str, error: &str) -> Result<(), StoreError>;

    async fn get(&self, job_key: &str) -> Result<Option<JobRecord>, StoreError>;
}

#[derive(FromRow)]
struct JobRow {
    job_key: String,
    poll_id: Uuid,
    run_at: DateTime<Utc>,
    attempts: i32,
    status: String,
    last_error: Option<String>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let state = match row.status.as_str() {
            "pending" => JobState::Pending,
            "abandoned" => JobState::Abandoned,
            other => return Err(StoreError::Corrupt(format!("unknown job status '{other}'"))),
        };
        Ok(JobRecord {
            job_key: row.job_key,
            poll_id: row.poll_id,
            run_at: row.run_at,
            attempts: row.attempts.max(0) as u32,
            state,
            last_error: row.last_error,
        })
    }
}

/// `scheduled_jobs` table in Postgres.
#[derive(Clone)]
pub struct PgJobQueue {
    pool: PgPool,
}

impl PgJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(
        &self,
        job_key: &str,
        poll_id: Uuid,
        run_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO scheduled_jobs (job_key, poll_id, run_at, attempts, status)
            VALUES ($1, $2, $3, 0, 'pending')
            ON CONFLICT (job_key) DO UPDATE
            SET poll_id = EXCLUDED.poll_id,
                run_at = EXCLUDED.run_at,
                attempts = 0,
                status = 'pending',
                last_error = NULL
            "#,
        )
        .bind(job_key)
        .bind(poll_id)
        .bind(run_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cancel(&self, job_key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM scheduled_jobs WHERE job_key = $1")
            .bind(job_key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: u32,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE scheduled_jobs
            SET attempts = attempts + 1, run_at = $2
            WHERE job_key IN (
                SELECT job_key FROM scheduled_jobs
                WHERE status = 'pending' AND run_at <= $1
                ORDER BY run_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING job_key, poll_id, run_at, attempts, status, last_error
            "#,
        )
        .bind(now)
        .bind(now + lease)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(JobRecord::try_from).collect()
    }

    async fn complete(&self, job_key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM scheduled_jobs WHERE job_key = $1")
            .bind(job_key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn retry_at(
        &self,
        job_key: &str,
        retry_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE scheduled_jobs SET run_at = $2, last_error = $3 WHERE job_key = $1")
            .bind(job_key)
            .bind(retry_at)
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn abandon(&self, job_key: &str, error: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE scheduled_jobs SET status = $2, last_error = $3 WHERE job_key = $1")
            .bind(job_key)
            .bind(JobState::Abandoned.as_str())
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(&self, job_key: &str) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(
            "SELECT job_key, poll_id, run_at, attempts, status, last_error FROM scheduled_jobs WHERE job_key = $1",
        )
        .bind(job_key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(JobRecord::try_from).transpose()
    }
}

/// In-process queue for development and tests. Jobs do not survive a restart.
#[derive(Default)]
pub struct MemoryJobQueue {
    jobs: Mutex<HashMap<String, JobRecord>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, JobRecord>>, StoreError> {
        self.jobs
            .lock()
            .map_err(|_| StoreError::Unavailable("memory queue lock poisoned".into()))
    }

    /// Jobs that can still be claimed.
    pub fn pending_len(&self) -> usize {
        self.lock()
            .map(|jobs| jobs.values().filter(|j| j.state == JobState::Pending).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(
        &self,
        job_key: &str,
        poll_id: Uuid,
        run_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.lock()?.insert(
            job_key.to_string(),
            JobRecord {
                job_key: job_key.to_string(),
                poll_id,
                run_at,
                attempts: 0,
                state: JobState::Pending,
                last_error: None,
            },
        );
        Ok(())
    }

    async fn cancel(&self, job_key: &str) -> Result<bool, StoreError> {
        Ok(self.lock()?.remove(job_key).is_some())
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: u32,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let mut jobs = self.lock()?;
        let mut due: Vec<&mut JobRecord> = jobs
            .values_mut()
            .filter(|j| j.state == JobState::Pending && j.run_at <= now)
            .collect();
        due.sort_by_key(|j| j.run_at);

        let mut claimed = Vec::new();
        for job in due.into_iter().take(limit as usize) {
            job.attempts += 1;
            job.run_at = now + lease;
            claimed.push(job.clone());
        }
        Ok(claimed)
    }

    async fn complete(&self, job_key: &str) -> Result<(), StoreError> {
        self.lock()?.remove(job_key);
        Ok(())
    }

    async fn retry_at(
        &self,
        job_key: &str,
        retry_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError> {
        if let Some(job) = self.lock()?.get_mut(job_key) {
            job.run_at = retry_at;
            job.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn abandon(&self, job_key: &str, error: &str) -> Result<(), StoreError> {
        if let Some(job) = self.lock()?.get_mut(job_key) {
            job.state = JobState::Abandoned;
            job.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn get(&self, job_key: &str) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.lock()?.get(job_key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_replaces_instead_of_duplicating() {
        let queue = MemoryJobQueue::new();
        let poll_id = Uuid::new_v4();
        let now = Utc::now();
        queue.enqueue("k", poll_id, now).await.unwrap();
        queue
            .enqueue("k", poll_id, now + Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(queue.pending_len(), 1);
        assert_eq!(
            queue.get("k").await.unwrap().map(|j| j.run_at),
            Some(now + Duration::minutes(5))
        );
    }

    #[tokio::test]
    async fn claimed_jobs_reappear_after_the_lease() {
        let queue = MemoryJobQueue::new();
        let now = Utc::now();
        queue.enqueue("k", Uuid::new_v4(), now).await.unwrap();
        let lease = Duration::seconds(30);

        let first = queue.claim_due(now, lease, 10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].attempts, 1);
        assert!(queue.claim_due(now, lease, 10).await.unwrap().is_empty());

        let again = queue.claim_due(now + lease, lease, 10).await.unwrap();
        assert_eq!(again[0].attempts, 2);
    }

    #[tokio::test]
    async fn abandoned_jobs_are_never_claimed() {
        let queue = MemoryJobQueue::new();
        let now = Utc::now();
        queue.enqueue("k", Uuid::new_v4(), now).await.unwrap();
        queue.abandon("k", "db down").await.unwrap();
        assert!(queue
            .claim_due(now + Duration::hours(1), Duration::seconds(30), 10)
            .await
            .unwrap()
            .is_empty());
        assert!(!queue.cancel("missing").await.unwrap());
        assert!(queue.cancel("k").await.unwrap());
    }
}
