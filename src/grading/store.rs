use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::core::time::primitive_now_utc;
use crate::db::models::GradingJob;
use crate::db::types::JobStatus;
use crate::repositories::grading_jobs;

use super::scorer::ScoreResult;

const LAST_ERROR_LIMIT: usize = 2_000;
pub(crate) const STALE_CLAIM_ERROR: &str = "claim expired before the job was written back";

#[derive(Debug, Clone)]
pub(crate) struct NewGradingJob {
    pub(crate) organization_id: String,
    pub(crate) batch_id: String,
    pub(crate) result_id: String,
    pub(crate) question_id: String,
    pub(crate) teacher_findings: String,
    pub(crate) student_findings: String,
    pub(crate) priority: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub(crate) struct QueueCounts {
    pub(crate) pending: i64,
    pub(crate) processing: i64,
    pub(crate) done: i64,
    pub(crate) error: i64,
}

impl QueueCounts {
    pub(crate) fn from_rows(rows: &[(JobStatus, i64)]) -> Self {
        let mut counts = Self::default();
        for (status, count) in rows {
            match status {
                JobStatus::Pending => counts.pending += count,
                JobStatus::Processing => counts.processing += count,
                JobStatus::Done => counts.done += count,
                JobStatus::Error => counts.error += count,
            }
        }
        counts
    }

    pub(crate) fn total(&self) -> i64 {
        self.pending + self.processing + self.done + self.error
    }
}

/// Durable queue of grading jobs.
///
/// `claim_batch` is the only way out of `pending`. Write-backs (`complete`,
/// `retry`, `defer`) take the claimed job and only apply while the row is
/// still in `processing` under that same claim, so a job recovered and
/// re-claimed elsewhere is never overwritten by the first worker.
#[async_trait]
pub(crate) trait JobStore: Send + Sync {
    /// Inserts a pending job. `None` when the (result, question) pair exists.
    async fn enqueue(&self, job: NewGradingJob) -> Result<Option<GradingJob>>;

    /// Atomically moves up to `limit` pending jobs to `processing`, highest
    /// priority first, then oldest.
    async fn claim_batch(&self, limit: usize) -> Result<Vec<GradingJob>>;

    async fn complete(&self, claimed: &GradingJob, result: &ScoreResult) -> Result<bool>;

    /// Spends one attempt. Returns the status the job landed in, or `None`
    /// when the claim no longer holds.
    async fn retry(&self, claimed: &GradingJob, error: &str) -> Result<Option<JobStatus>>;

    /// Returns a claimed job to `pending` without spending an attempt.
    async fn defer(&self, claimed: &GradingJob) -> Result<bool>;

    /// Treats claims older than `older_than` as failed attempts.
    async fn recover_stale(&self, older_than: Duration) -> Result<Vec<(String, JobStatus)>>;

    async fn counts(&self) -> Result<QueueCounts>;

    async fn find(&self, job_id: &str) -> Result<Option<GradingJob>>;

    async fn health(&self) -> Result<()>;
}

#[derive(Clone)]
pub(crate) struct PgJobStore {
    pool: PgPool,
    max_attempts: i32,
}

impl PgJobStore {
    pub(crate) fn new(pool: PgPool, max_attempts: i32) -> Self {
        Self { pool, max_attempts }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn enqueue(&self, job: NewGradingJob) -> Result<Option<GradingJob>> {
        let id = Uuid::new_v4().to_string();
        grading_jobs::insert_if_absent(
            &self.pool,
            grading_jobs::CreateGradingJob {
                id: &id,
                organization_id: &job.organization_id,
                batch_id: &job.batch_id,
                result_id: &job.result_id,
                question_id: &job.question_id,
                teacher_findings: &job.teacher_findings,
                student_findings: &job.student_findings,
                priority: job.priority,
                created_at: primitive_now_utc(),
            },
        )
        .await
        .context("Failed to enqueue grading job")
    }

    async fn claim_batch(&self, limit: usize) -> Result<Vec<GradingJob>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        grading_jobs::claim_batch(&self.pool, limit, primitive_now_utc())
            .await
            .context("Failed to claim grading jobs")
    }

    async fn complete(&self, claimed: &GradingJob, result: &ScoreResult) -> Result<bool> {
        grading_jobs::mark_done(
            &self.pool,
            claim_ref(claimed),
            grading_jobs::CompletionUpdate {
                score: result.score,
                feedback: result.feedback.clone(),
                analysis: result.analysis.clone(),
                completed_at: primitive_now_utc(),
            },
        )
        .await
        .with_context(|| format!("Failed to complete grading job {}", claimed.id))
    }

    async fn retry(&self, claimed: &GradingJob, error: &str) -> Result<Option<JobStatus>> {
        grading_jobs::record_failure(
            &self.pool,
            claim_ref(claimed),
            &truncate_error(error),
            self.max_attempts,
            primitive_now_utc(),
        )
        .await
        .with_context(|| format!("Failed to record failure for grading job {}", claimed.id))
    }

    async fn defer(&self, claimed: &GradingJob) -> Result<bool> {
        grading_jobs::defer(&self.pool, claim_ref(claimed), primitive_now_utc())
            .await
            .with_context(|| format!("Failed to defer grading job {}", claimed.id))
    }

    async fn recover_stale(&self, older_than: Duration) -> Result<Vec<(String, JobStatus)>> {
        let now = primitive_now_utc();
        let claimed_before = now - older_than;
        grading_jobs::recover_stale(
            &self.pool,
            claimed_before,
            STALE_CLAIM_ERROR,
            self.max_attempts,
            now,
        )
        .await
        .context("Failed to recover stale grading jobs")
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let rows = grading_jobs::count_by_status(&self.pool)
            .await
            .context("Failed to count grading jobs")?;
        Ok(QueueCounts::from_rows(&rows))
    }

    async fn find(&self, job_id: &str) -> Result<Option<GradingJob>> {
        grading_jobs::find_by_id(&self.pool, job_id)
            .await
            .with_context(|| format!("Failed to load grading job {job_id}"))
    }

    async fn health(&self) -> Result<()> {
        grading_jobs::ping(&self.pool).await.context("Database ping failed")
    }
}

fn claim_ref(job: &GradingJob) -> grading_jobs::ClaimRef<'_> {
    grading_jobs::ClaimRef { job_id: &job.id, claimed_at: job.claimed_at }
}

pub(crate) fn truncate_error(error: &str) -> String {
    if error.chars().count() <= LAST_ERROR_LIMIT {
        return error.to_string();
    }
    error.chars().take(LAST_ERROR_LIMIT).collect()
}
