use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use constant_time_eq::constant_time_eq;
use validator::Validate;

use crate::api::errors::ApiError;
use crate::core::state::AppState;
use crate::grading::drain::DrainSummary;
use crate::schemas::grading::{
    CredentialStatsResponse, DrainQuery, GradingJobCreate, GradingJobResponse, QueueStatsResponse,
};

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/jobs", post(enqueue_job))
        .route("/jobs/:job_id", get(get_job))
        .route("/drain", get(drain).post(drain))
        .route("/queue", get(queue_stats))
        .route("/credentials", get(credential_stats))
}

async fn enqueue_job(
    State(state): State<AppState>,
    Json(payload): Json<GradingJobCreate>,
) -> Result<(StatusCode, Json<GradingJobResponse>), ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let result_id = payload.result_id.clone();
    let question_id = payload.question_id.clone();
    let job = state
        .jobs()
        .enqueue(payload.into_new_job(state.settings().queue().default_priority))
        .await
        .map_err(|e| ApiError::internal(e, "Failed to enqueue grading job"))?;

    let Some(job) = job else {
        return Err(ApiError::Conflict(format!(
            "Grading job already exists for result {result_id} question {question_id}"
        )));
    };

    metrics::counter!("grading_jobs_enqueued_total").increment(1);
    tracing::info!(
        job_id = %job.id,
        result_id = %job.result_id,
        question_id = %job.question_id,
        priority = job.priority,
        "Grading job enqueued"
    );

    Ok((StatusCode::ACCEPTED, Json(GradingJobResponse::from_db(job))))
}

async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<GradingJobResponse>, ApiError> {
    let job = state
        .jobs()
        .find(&job_id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to load grading job"))?
        .ok_or_else(|| ApiError::NotFound("Grading job not found".to_string()))?;

    Ok(Json(GradingJobResponse::from_db(job)))
}

/// Runs one bounded drain and reports what it did. Meant to be hit by a
/// scheduler; each call finishes within the configured time budget.
async fn drain(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<DrainQuery>,
) -> Result<Json<DrainSummary>, ApiError> {
    authorize_trigger(&state, &headers)?;
    query.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let controller = state.drain_controller();
    let limit = query.limit.unwrap_or(controller.policy().default_limit);
    let rounds = query.rounds.unwrap_or(controller.policy().default_rounds);

    let summary = controller
        .drain(limit, rounds)
        .await
        .map_err(|e| ApiError::ServiceUnavailable(format!("Drain aborted: {e:#}")))?;

    Ok(Json(summary))
}

async fn queue_stats(State(state): State<AppState>) -> Result<Json<QueueStatsResponse>, ApiError> {
    let counts = state
        .monitor()
        .queue_stats()
        .await
        .map_err(|e| ApiError::internal(e, "Failed to read queue stats"))?;

    Ok(Json(QueueStatsResponse::from(counts)))
}

async fn credential_stats(
    State(state): State<AppState>,
) -> Result<Json<CredentialStatsResponse>, ApiError> {
    let pool = state.credentials();
    let credentials = state
        .monitor()
        .credential_stats()
        .await
        .map_err(|e| ApiError::internal(e, "Failed to read credential stats"))?;
    let available = pool
        .available()
        .await
        .map_err(|e| ApiError::internal(e, "Failed to read credential stats"))?;

    Ok(Json(CredentialStatsResponse {
        ledger: pool.ledger_kind(),
        rpm_limit: pool.policy().rpm_limit,
        window_seconds: pool.policy().window.as_secs(),
        available,
        credentials,
    }))
}

fn authorize_trigger(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(secret) = state.settings().drain().trigger_secret.as_deref() else {
        return Ok(());
    };

    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim);

    match provided {
        Some(token) if constant_time_eq(token.as_bytes(), secret.as_bytes()) => Ok(()),
        _ => Err(ApiError::Unauthorized("Invalid drain trigger credentials")),
    }
}
