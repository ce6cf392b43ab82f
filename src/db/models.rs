use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use time::PrimitiveDateTime;

use crate::db::types::JobStatus;

/// One grading request for a single (result, question) pair.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct GradingJob {
    pub(crate) id: String,
    pub(crate) organization_id: String,
    pub(crate) batch_id: String,
    pub(crate) result_id: String,
    pub(crate) question_id: String,
    pub(crate) teacher_findings: String,
    pub(crate) student_findings: String,
    pub(crate) status: JobStatus,
    pub(crate) attempts: i32,
    pub(crate) deferrals: i32,
    pub(crate) priority: i32,
    pub(crate) last_error: Option<String>,
    pub(crate) score: Option<f64>,
    pub(crate) feedback: Option<String>,
    pub(crate) analysis: Option<Json<serde_json::Value>>,
    pub(crate) claimed_at: Option<PrimitiveDateTime>,
    pub(crate) completed_at: Option<PrimitiveDateTime>,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
}
