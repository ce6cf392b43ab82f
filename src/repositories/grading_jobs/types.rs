use time::PrimitiveDateTime;

pub(crate) const COLUMNS: &str = "\
    id, organization_id, batch_id, result_id, question_id, teacher_findings, \
    student_findings, status, attempts, deferrals, priority, last_error, score, feedback, \
    analysis, claimed_at, completed_at, created_at, updated_at";

pub(crate) struct CreateGradingJob<'a> {
    pub(crate) id: &'a str,
    pub(crate) organization_id: &'a str,
    pub(crate) batch_id: &'a str,
    pub(crate) result_id: &'a str,
    pub(crate) question_id: &'a str,
    pub(crate) teacher_findings: &'a str,
    pub(crate) student_findings: &'a str,
    pub(crate) priority: i32,
    pub(crate) created_at: PrimitiveDateTime,
}

/// Identifies one claim of a job: the row id plus the `claimed_at` stamp the
/// claim wrote.
#[derive(Clone, Copy)]
pub(crate) struct ClaimRef<'a> {
    pub(crate) job_id: &'a str,
    pub(crate) claimed_at: Option<PrimitiveDateTime>,
}

pub(crate) struct CompletionUpdate {
    pub(crate) score: f64,
    pub(crate) feedback: Option<String>,
    pub(crate) analysis: serde_json::Value,
    pub(crate) completed_at: PrimitiveDateTime,
}
