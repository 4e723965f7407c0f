//! Durable analysis job queue backed by `analysis_jobs`.
//!
//! Claiming is a single atomic statement (`FOR UPDATE SKIP LOCKED`), so at
//! most one worker ever owns a job without any application-level locking.

use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::Result;

pub const WATCHDOG_ERROR: &str = "Job timed out. Reset by watchdog.";

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AnalysisJob {
    pub id: i64,
    pub conversation_id: Uuid,
    pub branch_id: String,
    pub status: String,
    pub attempts: i32,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Terminal outcome of a failure report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Released back to `pending` for another attempt.
    Retried,
    /// Attempt cap reached; the job is permanently `failed`.
    Failed,
}

#[derive(Clone)]
pub struct JobQueue {
    pool: PgPool,
}

impl JobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a pending job for a conversation branch. Returns the job id,
    /// or `None` when one already exists for that branch.
    pub async fn enqueue(&self, conversation_id: Uuid, branch_id: &str) -> Result<Option<i64>> {
        let id: Option<(i64,)> = sqlx::query_as(
            "INSERT INTO analysis_jobs (conversation_id, branch_id)
             VALUES ($1, $2)
             ON CONFLICT (conversation_id, branch_id) DO NOTHING
             RETURNING id",
        )
        .bind(conversation_id)
        .bind(branch_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id.map(|(id,)| id))
    }

    /// Atomically claim the oldest pending job, bumping its attempt counter.
    pub async fn claim_next(&self) -> Result<Option<AnalysisJob>> {
        let job: Option<AnalysisJob> = sqlx::query_as(
            "UPDATE analysis_jobs SET status='processing', attempts=attempts+1,
                    processing_started_at=now(), updated_at=now()
             WHERE id = (SELECT id FROM analysis_jobs
                         WHERE status='pending' ORDER BY created_at
                         FOR UPDATE SKIP LOCKED LIMIT 1)
             RETURNING *",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    pub async fn complete(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE analysis_jobs
                SET status='completed', completed_at=now(), updated_at=now(),
                    last_error=NULL
              WHERE id=$1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a transient failure: back to `pending` for another attempt, or
    /// terminally `failed` once the attempt cap is reached.
    pub async fn release_failed(
        &self,
        id: i64,
        error: &str,
        max_attempts: i32,
    ) -> Result<JobOutcome> {
        let (status,): (String,) = sqlx::query_as(
            "UPDATE analysis_jobs
                SET status = CASE WHEN attempts >= $2 THEN 'failed' ELSE 'pending' END,
                    completed_at = CASE WHEN attempts >= $2 THEN now() ELSE NULL END,
                    processing_started_at = NULL,
                    last_error = $3,
                    updated_at = now()
              WHERE id = $1
             RETURNING status",
        )
        .bind(id)
        .bind(max_attempts)
        .bind(error)
        .fetch_one(&self.pool)
        .await?;

        Ok(if status == "failed" {
            JobOutcome::Failed
        } else {
            JobOutcome::Retried
        })
    }

    /// Revert jobs stuck in `processing` past `stuck_after` back to
    /// `pending`. Attempt counters are left untouched; the claim already
    /// charged the attempt. Returns how many rows were reset.
    pub async fn watchdog_reset(&self, stuck_after: Duration) -> Result<u64> {
        let cutoff = Utc::now() - stuck_after;
        let result = sqlx::query(
            "UPDATE analysis_jobs
                SET status='pending', processing_started_at=NULL,
                    last_error=$2, updated_at=now()
              WHERE status='processing' AND processing_started_at < $1",
        )
        .bind(cutoff)
        .bind(WATCHDOG_ERROR)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
