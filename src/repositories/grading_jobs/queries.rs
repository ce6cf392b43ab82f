use sqlx::PgPool;

use crate::db::models::GradingJob;
use crate::db::types::JobStatus;

use super::types::COLUMNS;

pub(crate) async fn find_by_id(
    pool: &PgPool,
    job_id: &str,
) -> Result<Option<GradingJob>, sqlx::Error> {
    let query = format!("SELECT {COLUMNS} FROM grading_jobs WHERE id = $1");
    sqlx::query_as::<_, GradingJob>(&query).bind(job_id).fetch_optional(pool).await
}

pub(crate) async fn count_by_status(pool: &PgPool) -> Result<Vec<(JobStatus, i64)>, sqlx::Error> {
    sqlx::query_as::<_, (JobStatus, i64)>(
        "SELECT status, COUNT(*)::BIGINT FROM grading_jobs GROUP BY status",
    )
    .fetch_all(pool)
    .await
}

pub(crate) async fn ping(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}
