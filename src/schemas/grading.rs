use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::core::time::format_primitive;
use crate::db::models::GradingJob;
use crate::db::types::JobStatus;
use crate::grading::credentials::CredentialStats;
use crate::grading::store::{NewGradingJob, QueueCounts};

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct GradingJobCreate {
    #[serde(alias = "organizationId")]
    #[validate(length(min = 1, max = 64, message = "organization_id must be 1-64 characters"))]
    pub(crate) organization_id: String,
    #[serde(alias = "batchId")]
    #[validate(length(min = 1, max = 64, message = "batch_id must be 1-64 characters"))]
    pub(crate) batch_id: String,
    #[serde(alias = "resultId")]
    #[validate(length(min = 1, max = 64, message = "result_id must be 1-64 characters"))]
    pub(crate) result_id: String,
    #[serde(alias = "questionId")]
    #[validate(length(min = 1, max = 64, message = "question_id must be 1-64 characters"))]
    pub(crate) question_id: String,
    #[serde(alias = "teacherFindings")]
    #[validate(length(min = 1, message = "teacher_findings must not be empty"))]
    pub(crate) teacher_findings: String,
    #[serde(alias = "studentFindings")]
    #[validate(length(min = 1, message = "student_findings must not be empty"))]
    pub(crate) student_findings: String,
    #[serde(default)]
    pub(crate) priority: Option<i32>,
}

impl GradingJobCreate {
    pub(crate) fn into_new_job(self, default_priority: i32) -> NewGradingJob {
        NewGradingJob {
            organization_id: self.organization_id,
            batch_id: self.batch_id,
            result_id: self.result_id,
            question_id: self.question_id,
            teacher_findings: self.teacher_findings,
            student_findings: self.student_findings,
            priority: self.priority.unwrap_or(default_priority),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct GradingJobResponse {
    pub(crate) id: String,
    pub(crate) organization_id: String,
    pub(crate) batch_id: String,
    pub(crate) result_id: String,
    pub(crate) question_id: String,
    pub(crate) status: JobStatus,
    pub(crate) attempts: i32,
    pub(crate) deferrals: i32,
    pub(crate) priority: i32,
    pub(crate) last_error: Option<String>,
    pub(crate) score: Option<f64>,
    pub(crate) feedback: Option<String>,
    pub(crate) analysis: Option<serde_json::Value>,
    pub(crate) claimed_at: Option<String>,
    pub(crate) completed_at: Option<String>,
    pub(crate) created_at: String,
    pub(crate) updated_at: String,
}

impl GradingJobResponse {
    pub(crate) fn from_db(job: GradingJob) -> Self {
        Self {
            id: job.id,
            organization_id: job.organization_id,
            batch_id: job.batch_id,
            result_id: job.result_id,
            question_id: job.question_id,
            status: job.status,
            attempts: job.attempts,
            deferrals: job.deferrals,
            priority: job.priority,
            last_error: job.last_error,
            score: job.score,
            feedback: job.feedback,
            analysis: job.analysis.map(|value| value.0),
            claimed_at: job.claimed_at.map(format_primitive),
            completed_at: job.completed_at.map(format_primitive),
            created_at: format_primitive(job.created_at),
            updated_at: format_primitive(job.updated_at),
        }
    }
}

#[derive(Debug, Default, Deserialize, Validate)]
pub(crate) struct DrainQuery {
    #[validate(range(min = 1, message = "limit must be at least 1"))]
    pub(crate) limit: Option<usize>,
    #[validate(range(min = 1, message = "rounds must be at least 1"))]
    pub(crate) rounds: Option<u32>,
}

#[derive(Debug, Serialize)]
pub(crate) struct QueueStatsResponse {
    #[serde(flatten)]
    pub(crate) counts: QueueCounts,
    pub(crate) total: i64,
}

impl From<QueueCounts> for QueueStatsResponse {
    fn from(counts: QueueCounts) -> Self {
        Self { total: counts.total(), counts }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct CredentialStatsResponse {
    pub(crate) ledger: &'static str,
    pub(crate) rpm_limit: u32,
    pub(crate) window_seconds: u64,
    pub(crate) available: usize,
    pub(crate) credentials: Vec<CredentialStats>,
}
