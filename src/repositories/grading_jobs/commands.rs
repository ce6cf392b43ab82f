use sqlx::types::Json;
use sqlx::PgPool;
use time::PrimitiveDateTime;

use crate::db::models::GradingJob;
use crate::db::types::JobStatus;

use super::types::{ClaimRef, CompletionUpdate, CreateGradingJob, COLUMNS};

/// Inserts a pending job. Returns `None` when a job already exists for the
/// same (result, question) pair.
pub(crate) async fn insert_if_absent(
    pool: &PgPool,
    params: CreateGradingJob<'_>,
) -> Result<Option<GradingJob>, sqlx::Error> {
    let query = format!(
        "INSERT INTO grading_jobs (
            id, organization_id, batch_id, result_id, question_id, teacher_findings,
            student_findings, status, attempts, deferrals, priority, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0, 0, $9, $10, $10)
        ON CONFLICT (result_id, question_id) DO NOTHING
        RETURNING {COLUMNS}"
    );

    sqlx::query_as::<_, GradingJob>(&query)
        .bind(params.id)
        .bind(params.organization_id)
        .bind(params.batch_id)
        .bind(params.result_id)
        .bind(params.question_id)
        .bind(params.teacher_findings)
        .bind(params.student_findings)
        .bind(JobStatus::Pending)
        .bind(params.priority)
        .bind(params.created_at)
        .fetch_optional(pool)
        .await
}

/// Moves up to `limit` pending rows to `processing` in one statement.
/// `SKIP LOCKED` lets overlapping drains each take disjoint rows; the outer
/// `status` guard keeps a row from being claimed twice if it was released
/// between the select and the update.
pub(crate) async fn claim_batch(
    pool: &PgPool,
    limit: i64,
    now: PrimitiveDateTime,
) -> Result<Vec<GradingJob>, sqlx::Error> {
    let query = format!(
        "WITH candidate AS (
            SELECT id
            FROM grading_jobs
            WHERE status = $1
            ORDER BY priority DESC, created_at ASC, id ASC
            FOR UPDATE SKIP LOCKED
            LIMIT $2
        )
        UPDATE grading_jobs
        SET status = $3,
            claimed_at = $4,
            updated_at = $4
        FROM candidate
        WHERE grading_jobs.id = candidate.id
          AND grading_jobs.status = $1
        RETURNING {}",
        qualified_columns("grading_jobs")
    );

    let mut jobs = sqlx::query_as::<_, GradingJob>(&query)
        .bind(JobStatus::Pending)
        .bind(limit)
        .bind(JobStatus::Processing)
        .bind(now)
        .fetch_all(pool)
        .await?;

    // RETURNING does not preserve the CTE ordering.
    jobs.sort_by(|a, b| {
        b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)).then(a.id.cmp(&b.id))
    });

    Ok(jobs)
}

/// Write-backs match the claim as well as the id: a worker whose claim was
/// recovered and handed to another drain updates nothing.
pub(crate) async fn mark_done(
    pool: &PgPool,
    claim: ClaimRef<'_>,
    params: CompletionUpdate,
) -> Result<bool, sqlx::Error> {
    let updated = sqlx::query(
        "UPDATE grading_jobs
         SET status = $1,
             score = $2,
             feedback = $3,
             analysis = $4,
             last_error = NULL,
             completed_at = $5,
             updated_at = $5
         WHERE id = $6 AND status = $7 AND claimed_at = $8",
    )
    .bind(JobStatus::Done)
    .bind(params.score)
    .bind(params.feedback)
    .bind(Json(params.analysis))
    .bind(params.completed_at)
    .bind(claim.job_id)
    .bind(JobStatus::Processing)
    .bind(claim.claimed_at)
    .execute(pool)
    .await?;

    Ok(updated.rows_affected() > 0)
}

/// Counts one failed attempt. The job goes back to `pending` while attempts
/// remain and to terminal `error` once `max_attempts` is reached. Returns the
/// new status, or `None` if the row was not held in `processing`.
pub(crate) async fn record_failure(
    pool: &PgPool,
    claim: ClaimRef<'_>,
    error: &str,
    max_attempts: i32,
    now: PrimitiveDateTime,
) -> Result<Option<JobStatus>, sqlx::Error> {
    sqlx::query_scalar::<_, JobStatus>(
        "UPDATE grading_jobs
         SET attempts = attempts + 1,
             status = CASE WHEN attempts + 1 >= $1 THEN $2 ELSE $3 END,
             last_error = $4,
             claimed_at = NULL,
             completed_at = CASE WHEN attempts + 1 >= $1 THEN $5 ELSE NULL END,
             updated_at = $5
         WHERE id = $6 AND status = $7 AND claimed_at = $8
         RETURNING status",
    )
    .bind(max_attempts)
    .bind(JobStatus::Error)
    .bind(JobStatus::Pending)
    .bind(error)
    .bind(now)
    .bind(claim.job_id)
    .bind(JobStatus::Processing)
    .bind(claim.claimed_at)
    .fetch_optional(pool)
    .await
}

/// Returns a claimed job to `pending` without spending an attempt.
pub(crate) async fn defer(
    pool: &PgPool,
    claim: ClaimRef<'_>,
    now: PrimitiveDateTime,
) -> Result<bool, sqlx::Error> {
    let updated = sqlx::query(
        "UPDATE grading_jobs
         SET status = $1,
             deferrals = deferrals + 1,
             claimed_at = NULL,
             updated_at = $2
         WHERE id = $3 AND status = $4 AND claimed_at = $5",
    )
    .bind(JobStatus::Pending)
    .bind(now)
    .bind(claim.job_id)
    .bind(JobStatus::Processing)
    .bind(claim.claimed_at)
    .execute(pool)
    .await?;

    Ok(updated.rows_affected() > 0)
}

/// Applies `record_failure` to every claim older than `claimed_before`.
pub(crate) async fn recover_stale(
    pool: &PgPool,
    claimed_before: PrimitiveDateTime,
    error: &str,
    max_attempts: i32,
    now: PrimitiveDateTime,
) -> Result<Vec<(String, JobStatus)>, sqlx::Error> {
    sqlx::query_as::<_, (String, JobStatus)>(
        "UPDATE grading_jobs
         SET attempts = attempts + 1,
             status = CASE WHEN attempts + 1 >= $1 THEN $2 ELSE $3 END,
             last_error = $4,
             claimed_at = NULL,
             completed_at = CASE WHEN attempts + 1 >= $1 THEN $5 ELSE NULL END,
             updated_at = $5
         WHERE status = $6
           AND claimed_at < $7
         RETURNING id, status",
    )
    .bind(max_attempts)
    .bind(JobStatus::Error)
    .bind(JobStatus::Pending)
    .bind(error)
    .bind(now)
    .bind(JobStatus::Processing)
    .bind(claimed_before)
    .fetch_all(pool)
    .await
}

fn qualified_columns(table: &str) -> String {
    COLUMNS
        .split(',')
        .map(|column| format!("{table}.{}", column.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}
