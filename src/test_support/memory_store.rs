use std::cmp::Reverse;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use sqlx::types::Json;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::core::time::primitive_now_utc;
use crate::db::models::GradingJob;
use crate::db::types::JobStatus;
use crate::grading::scorer::ScoreResult;
use crate::grading::store::{
    truncate_error, JobStore, NewGradingJob, QueueCounts, STALE_CLAIM_ERROR,
};

/// In-memory `JobStore` with the same transition rules as the Postgres one.
/// All mutations happen under one lock, which gives `claim_batch` the same
/// exclusivity `SKIP LOCKED` gives in the database.
pub(crate) struct MemoryJobStore {
    max_attempts: i32,
    jobs: Mutex<Vec<GradingJob>>,
    fail_writes: AtomicBool,
}

impl MemoryJobStore {
    pub(crate) fn new(max_attempts: i32) -> Self {
        Self { max_attempts, jobs: Mutex::new(Vec::new()), fail_writes: AtomicBool::new(false) }
    }

    /// Makes `complete`, `retry` and `defer` return errors.
    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub(crate) async fn all(&self) -> Vec<GradingJob> {
        self.jobs.lock().await.clone()
    }

    pub(crate) async fn backdate_claims(&self, by: Duration) {
        let mut jobs = self.jobs.lock().await;
        for job in jobs.iter_mut() {
            if let Some(claimed_at) = job.claimed_at {
                job.claimed_at = Some(claimed_at - by);
            }
        }
    }

    fn check_writes(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("job store unavailable");
        }
        Ok(())
    }

    fn spend_attempt(job: &mut GradingJob, error: &str, max_attempts: i32) -> JobStatus {
        let now = primitive_now_utc();
        job.attempts += 1;
        job.status =
            if job.attempts >= max_attempts { JobStatus::Error } else { JobStatus::Pending };
        job.last_error = Some(truncate_error(error));
        job.claimed_at = None;
        job.completed_at = job.status.is_terminal().then_some(now);
        job.updated_at = now;
        job.status
    }
}

fn holds_claim(job: &GradingJob, claimed: &GradingJob) -> bool {
    job.id == claimed.id
        && job.status == JobStatus::Processing
        && job.claimed_at.is_some()
        && job.claimed_at == claimed.claimed_at
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(&self, job: NewGradingJob) -> Result<Option<GradingJob>> {
        let mut jobs = self.jobs.lock().await;
        if jobs
            .iter()
            .any(|item| item.result_id == job.result_id && item.question_id == job.question_id)
        {
            return Ok(None);
        }

        let now = primitive_now_utc();
        let record = GradingJob {
            id: Uuid::new_v4().to_string(),
            organization_id: job.organization_id,
            batch_id: job.batch_id,
            result_id: job.result_id,
            question_id: job.question_id,
            teacher_findings: job.teacher_findings,
            student_findings: job.student_findings,
            status: JobStatus::Pending,
            attempts: 0,
            deferrals: 0,
            priority: job.priority,
            last_error: None,
            score: None,
            feedback: None,
            analysis: None,
            claimed_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        jobs.push(record.clone());
        Ok(Some(record))
    }

    async fn claim_batch(&self, limit: usize) -> Result<Vec<GradingJob>> {
        let mut jobs = self.jobs.lock().await;
        let mut pending: Vec<usize> = jobs
            .iter()
            .enumerate()
            .filter(|(_, job)| job.status == JobStatus::Pending)
            .map(|(idx, _)| idx)
            .collect();
        pending.sort_by_key(|idx| (Reverse(jobs[*idx].priority), jobs[*idx].created_at));

        let now = primitive_now_utc();
        let mut claimed = Vec::new();
        for idx in pending.into_iter().take(limit) {
            let job = &mut jobs[idx];
            job.status = JobStatus::Processing;
            job.claimed_at = Some(now);
            job.updated_at = now;
            claimed.push(job.clone());
        }
        Ok(claimed)
    }

    async fn complete(&self, claimed: &GradingJob, result: &ScoreResult) -> Result<bool> {
        self.check_writes()?;
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.iter_mut().find(|job| holds_claim(job, claimed)) else {
            return Ok(false);
        };

        let now = primitive_now_utc();
        job.status = JobStatus::Done;
        job.score = Some(result.score);
        job.feedback = result.feedback.clone();
        job.analysis = Some(Json(result.analysis.clone()));
        job.last_error = None;
        job.completed_at = Some(now);
        job.updated_at = now;
        Ok(true)
    }

    async fn retry(&self, claimed: &GradingJob, error: &str) -> Result<Option<JobStatus>> {
        self.check_writes()?;
        let mut jobs = self.jobs.lock().await;
        Ok(jobs
            .iter_mut()
            .find(|job| holds_claim(job, claimed))
            .map(|job| Self::spend_attempt(job, error, self.max_attempts)))
    }

    async fn defer(&self, claimed: &GradingJob) -> Result<bool> {
        self.check_writes()?;
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.iter_mut().find(|job| holds_claim(job, claimed)) else {
            return Ok(false);
        };

        job.status = JobStatus::Pending;
        job.deferrals += 1;
        job.claimed_at = None;
        job.updated_at = primitive_now_utc();
        Ok(true)
    }

    async fn recover_stale(&self, older_than: Duration) -> Result<Vec<(String, JobStatus)>> {
        let cutoff = primitive_now_utc() - older_than;
        let mut jobs = self.jobs.lock().await;
        Ok(jobs
            .iter_mut()
            .filter(|job| {
                job.status == JobStatus::Processing
                    && job.claimed_at.is_some_and(|claimed_at| claimed_at < cutoff)
            })
            .map(|job| {
                let status = Self::spend_attempt(job, STALE_CLAIM_ERROR, self.max_attempts);
                (job.id.clone(), status)
            })
            .collect())
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let jobs = self.jobs.lock().await;
        let rows = jobs.iter().map(|job| (job.status, 1)).collect::<Vec<_>>();
        Ok(QueueCounts::from_rows(&rows))
    }

    async fn find(&self, job_id: &str) -> Result<Option<GradingJob>> {
        Ok(self.jobs.lock().await.iter().find(|job| job.id == job_id).cloned())
    }

    async fn health(&self) -> Result<()> {
        Ok(())
    }
}
