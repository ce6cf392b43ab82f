use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use tokio::task::JoinSet;

use crate::core::time::primitive_now_utc;
use crate::db::models::GradingJob;
use crate::db::types::JobStatus;

use super::credentials::{CredentialPool, ReleaseOutcome};
use super::scorer::{ScoreError, ScoreRequest, Scorer};
use super::store::JobStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub(crate) struct RoundSummary {
    /// Credentials that were eligible when the round started.
    pub(crate) capacity: usize,
    pub(crate) claimed: usize,
    pub(crate) succeeded: usize,
    pub(crate) retried: usize,
    pub(crate) failed: usize,
    pub(crate) deferred: usize,
}

impl RoundSummary {
    fn record(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Graded => self.succeeded += 1,
            JobOutcome::Retried => self.retried += 1,
            JobOutcome::Failed => self.failed += 1,
            JobOutcome::Deferred => self.deferred += 1,
            JobOutcome::Superseded => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobOutcome {
    Graded,
    Retried,
    Failed,
    Deferred,
    /// The claim no longer held at write-back time.
    Superseded,
}

impl JobOutcome {
    fn as_str(self) -> &'static str {
        match self {
            Self::Graded => "graded",
            Self::Retried => "retried",
            Self::Failed => "failed",
            Self::Deferred => "deferred",
            Self::Superseded => "superseded",
        }
    }
}

/// Runs one bounded batch: claim as many jobs as there are usable
/// credentials, score them concurrently, write every outcome back.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    store: Arc<dyn JobStore>,
    pool: CredentialPool,
    scorer: Arc<dyn Scorer>,
    call_timeout: Duration,
}

impl Dispatcher {
    pub(crate) fn new(
        store: Arc<dyn JobStore>,
        pool: CredentialPool,
        scorer: Arc<dyn Scorer>,
        call_timeout: Duration,
    ) -> Self {
        Self { store, pool, scorer, call_timeout }
    }

    /// Runs on its own task. Dropping the caller (a closed HTTP request, an
    /// outer timeout) leaves the round running, so claimed jobs are still
    /// written back and their leases released.
    pub(crate) async fn run_round(&self, limit: usize) -> Result<RoundSummary> {
        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.execute_round(limit).await })
            .await
            .map_err(|err| anyhow!("grading round task failed: {err}"))?
    }

    async fn execute_round(&self, limit: usize) -> Result<RoundSummary> {
        let capacity = self.pool.available().await?;
        let mut summary = RoundSummary { capacity, ..RoundSummary::default() };

        let batch = limit.min(capacity);
        if batch == 0 {
            tracing::debug!(limit, capacity, "No grading capacity this round");
            return Ok(summary);
        }

        let jobs = self.store.claim_batch(batch).await?;
        summary.claimed = jobs.len();
        if jobs.is_empty() {
            return Ok(summary);
        }

        let mut tasks = JoinSet::new();
        for job in jobs {
            let dispatcher = self.clone();
            tasks.spawn(async move {
                let job_id = job.id.clone();
                (job_id, dispatcher.process(job).await)
            });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) => summary.record(outcome),
                Ok((job_id, Err(err))) => {
                    tracing::error!(job_id = %job_id, error = %err, "Grading write-back failed");
                    first_error.get_or_insert(err);
                }
                Err(err) => {
                    tracing::error!(error = %err, "Grading task aborted");
                    first_error.get_or_insert(anyhow!("grading task aborted: {err}"));
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }

        tracing::info!(
            claimed = summary.claimed,
            succeeded = summary.succeeded,
            retried = summary.retried,
            failed = summary.failed,
            deferred = summary.deferred,
            "Grading round finished"
        );

        Ok(summary)
    }

    async fn process(&self, job: GradingJob) -> Result<JobOutcome> {
        observe_queue_latency(&job);

        let lease = match self.pool.acquire().await {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                self.store.defer(&job).await?;
                tracing::debug!(job_id = %job.id, "No credential available; job deferred");
                return Ok(record_outcome(JobOutcome::Deferred));
            }
            Err(err) => {
                self.store.defer(&job).await?;
                return Err(err);
            }
        };

        let credential_id = lease.credential().id().to_string();
        let request = ScoreRequest::from(&job);
        let started = Instant::now();
        let result = match tokio::time::timeout(
            self.call_timeout,
            self.scorer.score(lease.credential(), &request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ScoreError::Timeout(self.call_timeout)),
        };
        metrics::histogram!("grading_duration_seconds").record(started.elapsed().as_secs_f64());

        let release_outcome = match &result {
            Ok(_) => ReleaseOutcome::Success,
            Err(err) if err.is_rate_limit() => ReleaseOutcome::RateLimited,
            Err(_) => ReleaseOutcome::Failure,
        };
        let released = self.pool.release(lease, release_outcome).await;

        let outcome = match result {
            Ok(score) => {
                if self.store.complete(&job, &score).await? {
                    tracing::info!(
                        job_id = %job.id,
                        credential = %credential_id,
                        score = score.score,
                        "Grading job completed"
                    );
                    JobOutcome::Graded
                } else {
                    JobOutcome::Superseded
                }
            }
            Err(err) => {
                let status = self.store.retry(&job, &err.to_string()).await?;
                tracing::warn!(
                    job_id = %job.id,
                    credential = %credential_id,
                    kind = err.kind(),
                    error = %err,
                    status = status.map(JobStatus::as_str).unwrap_or("superseded"),
                    "Grading attempt failed"
                );
                match status {
                    Some(status) if status.is_terminal() => JobOutcome::Failed,
                    Some(_) => JobOutcome::Retried,
                    None => JobOutcome::Superseded,
                }
            }
        };

        released.context("Credential release failed after grading")?;

        Ok(record_outcome(outcome))
    }
}

fn record_outcome(outcome: JobOutcome) -> JobOutcome {
    metrics::counter!("grading_jobs_total", "outcome" => outcome.as_str()).increment(1);
    outcome
}

fn observe_queue_latency(job: &GradingJob) {
    let claimed_at = job.claimed_at.unwrap_or_else(primitive_now_utc);
    let waited = (claimed_at - job.created_at).as_seconds_f64().max(0.0);
    metrics::histogram!("grading_queue_latency_seconds").record(waited);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grading::credentials::Credential;
    use crate::test_support::memory_store::MemoryJobStore;
    use crate::test_support::scorer::{ScriptedScorer, Step};
    use crate::test_support::{credential_pool, new_job, rate_policy};

    fn dispatcher(
        store: &Arc<MemoryJobStore>,
        pool: CredentialPool,
        scorer: &Arc<ScriptedScorer>,
    ) -> Dispatcher {
        Dispatcher::new(store.clone(), pool, scorer.clone(), Duration::from_millis(200))
    }

    #[tokio::test]
    async fn round_is_bounded_by_limit_and_capacity() {
        let store = Arc::new(MemoryJobStore::new(3));
        for idx in 0..10 {
            store.enqueue(new_job(&format!("r{idx}"), "q1", 0)).await.unwrap();
        }
        let scorer = Arc::new(ScriptedScorer::succeeding());
        let dispatcher = dispatcher(&store, credential_pool(4, 8), &scorer);

        let summary = dispatcher.run_round(6).await.unwrap();

        assert_eq!(summary.capacity, 4);
        assert_eq!(summary.claimed, 4);
        assert_eq!(summary.succeeded, 4);
        let counts = store.counts().await.unwrap();
        assert_eq!(counts.done, 4);
        assert_eq!(counts.pending, 6);
        assert_eq!(counts.processing, 0);
    }

    #[tokio::test]
    async fn rate_limit_penalizes_credential_and_requeues_job() {
        let store = Arc::new(MemoryJobStore::new(3));
        let job = store.enqueue(new_job("r1", "q1", 0)).await.unwrap().expect("job");
        let scorer = Arc::new(ScriptedScorer::with_steps([Step::RateLimited]));
        let pool = credential_pool(2, 8);
        let dispatcher = dispatcher(&store, pool.clone(), &scorer);

        let summary = dispatcher.run_round(6).await.unwrap();
        assert_eq!(summary.retried, 1);

        let stats = pool.stats().await.unwrap();
        assert_eq!(stats[0].id, "key-1");
        assert_eq!(stats[0].penalty_count, 1);
        assert!(stats[0].backoff_seconds > 0);
        assert_eq!(stats[1].penalty_count, 0);

        let stored = store.find(&job.id).await.unwrap().expect("stored job");
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.attempts, 1);
        assert!(stored.last_error.unwrap_or_default().contains("rate limit"));
    }

    #[tokio::test]
    async fn permanent_failure_ends_in_error_after_max_attempts() {
        let store = Arc::new(MemoryJobStore::new(3));
        let job = store.enqueue(new_job("r1", "q1", 0)).await.unwrap().expect("job");
        let scorer = Arc::new(ScriptedScorer::failing());
        let dispatcher = dispatcher(&store, credential_pool(1, 8), &scorer);

        let mut summaries = Vec::new();
        for _ in 0..5 {
            summaries.push(dispatcher.run_round(1).await.unwrap());
        }

        let stored = store.find(&job.id).await.unwrap().expect("stored job");
        assert_eq!(stored.status, JobStatus::Error);
        assert_eq!(stored.attempts, 3);
        assert_eq!(summaries.iter().map(|s| s.retried).sum::<usize>(), 2);
        assert_eq!(summaries.iter().map(|s| s.failed).sum::<usize>(), 1);
        assert_eq!(scorer.calls().len(), 3);
    }

    #[tokio::test]
    async fn failing_calls_still_respect_rpm() {
        let store = Arc::new(MemoryJobStore::new(100));
        store.enqueue(new_job("r1", "q1", 0)).await.unwrap();
        let scorer = Arc::new(ScriptedScorer::failing());
        let pool = credential_pool(1, 2);
        let dispatcher = dispatcher(&store, pool.clone(), &scorer);

        for _ in 0..10 {
            dispatcher.run_round(1).await.unwrap();
        }

        assert_eq!(scorer.calls().len(), 2);
        let stats = pool.stats().await.unwrap();
        assert_eq!(stats[0].request_count, 2);
        assert_eq!(stats[0].penalty_count, 0);
        assert_eq!(store.counts().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn slow_scorer_counts_as_failed_attempt() {
        let store = Arc::new(MemoryJobStore::new(3));
        let job = store.enqueue(new_job("r1", "q1", 0)).await.unwrap().expect("job");
        let scorer =
            Arc::new(ScriptedScorer::with_steps([Step::Delay(Duration::from_millis(500))]));
        let pool = credential_pool(1, 8);
        let dispatcher = dispatcher(&store, pool.clone(), &scorer);

        let summary = dispatcher.run_round(1).await.unwrap();

        assert_eq!(summary.retried, 1);
        let stored = store.find(&job.id).await.unwrap().expect("stored job");
        assert_eq!(stored.status, JobStatus::Pending);
        assert!(stored.last_error.unwrap_or_default().contains("timed out"));
        let stats = pool.stats().await.unwrap();
        assert_eq!(stats[0].in_flight, 0);
        assert_eq!(stats[0].penalty_count, 0);
    }

    #[tokio::test]
    async fn exhausted_pool_claims_nothing() {
        let store = Arc::new(MemoryJobStore::new(3));
        store.enqueue(new_job("r1", "q1", 0)).await.unwrap();
        let pool = CredentialPool::local(vec![Credential::new("key-1", "k")], rate_policy(1));
        let held = pool.acquire().await.unwrap().expect("lease");
        let scorer = Arc::new(ScriptedScorer::succeeding());
        let dispatcher = dispatcher(&store, pool.clone(), &scorer);

        let summary = dispatcher.run_round(6).await.unwrap();

        assert_eq!(summary, RoundSummary::default());
        assert_eq!(store.counts().await.unwrap().pending, 1);
        pool.release(held, ReleaseOutcome::Failure).await.unwrap();
    }

    #[tokio::test]
    async fn store_errors_surface_after_round() {
        let store = Arc::new(MemoryJobStore::new(3));
        store.enqueue(new_job("r1", "q1", 0)).await.unwrap();
        store.enqueue(new_job("r2", "q1", 0)).await.unwrap();
        store.fail_writes(true);
        let scorer = Arc::new(ScriptedScorer::succeeding());
        let dispatcher = dispatcher(&store, credential_pool(2, 8), &scorer);

        let result = dispatcher.run_round(2).await;

        assert!(result.is_err());
        assert_eq!(scorer.calls().len(), 2);
    }
}
