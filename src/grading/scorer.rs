use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use thiserror::Error;

use crate::core::config::Settings;
use crate::db::models::GradingJob;

use super::credentials::Credential;

pub(crate) const MAX_SCORE: f64 = 100.0;

const SCORING_SYSTEM_PROMPT: &str = r#"You are an experienced digital forensics instructor.
You compare a student's findings for one investigation question against the instructor's
reference findings and grade how completely and accurately the student covered them.

Grading rules:
- Award credit for every reference point the student identified, even if worded differently.
- Deduct for reference points that are missing.
- Deduct for claims that contradict the evidence described in the reference findings.
- Do not reward volume; unrelated material earns nothing.

Respond with strict JSON:
{
  "score": <number from 0 to 100>,
  "feedback": "short feedback addressed to the student",
  "matched_points": ["reference points the student covered"],
  "missed_points": ["reference points the student did not cover"],
  "incorrect_points": ["student claims that are wrong"]
}
"#;

const ERROR_EXCERPT_LIMIT: usize = 300;

/// Inputs for one scoring call.
#[derive(Debug, Clone)]
pub(crate) struct ScoreRequest {
    pub(crate) job_id: String,
    pub(crate) question_id: String,
    pub(crate) teacher_findings: String,
    pub(crate) student_findings: String,
}

impl From<&GradingJob> for ScoreRequest {
    fn from(job: &GradingJob) -> Self {
        Self {
            job_id: job.id.clone(),
            question_id: job.question_id.clone(),
            teacher_findings: job.teacher_findings.clone(),
            student_findings: job.student_findings.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ScoreResult {
    pub(crate) score: f64,
    pub(crate) feedback: Option<String>,
    pub(crate) analysis: Value,
}

#[derive(Debug, Error)]
pub(crate) enum ScoreError {
    #[error("scorer rate limit exceeded: {0}")]
    RateLimited(String),
    #[error("scorer call timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed scorer response: {0}")]
    Malformed(String),
    #[error("scorer request failed: {0}")]
    Upstream(String),
}

impl ScoreError {
    pub(crate) fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited(_) => "rate_limited",
            Self::Timeout(_) => "timeout",
            Self::Malformed(_) => "malformed",
            Self::Upstream(_) => "upstream",
        }
    }
}

/// A single scoring attempt with the given credential. Implementations must
/// not retry internally; retries are the queue's job.
#[async_trait]
pub(crate) trait Scorer: Send + Sync {
    async fn score(
        &self,
        credential: &Credential,
        request: &ScoreRequest,
    ) -> Result<ScoreResult, ScoreError>;
}

/// OpenAI-compatible chat-completions client.
#[derive(Debug, Clone)]
pub(crate) struct HttpScorer {
    client: Client,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: f64,
}

impl HttpScorer {
    pub(crate) fn from_settings(settings: &Settings) -> Result<Self> {
        let scorer = settings.scorer();
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(scorer.timeout_seconds))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: scorer.base_url.trim_end_matches('/').to_string(),
            model: scorer.model.clone(),
            max_tokens: scorer.max_tokens,
            temperature: scorer.temperature,
        })
    }

    fn payload(&self, request: &ScoreRequest) -> Value {
        let user_prompt = format!(
            "Question: {}\n\nReference findings:\n{}\n\nStudent findings:\n{}\n\nGrade the student findings against the reference findings. Use the JSON format from the system prompt.",
            request.question_id, request.teacher_findings, request.student_findings
        );

        json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SCORING_SYSTEM_PROMPT},
                {"role": "user", "content": user_prompt}
            ],
            "max_completion_tokens": self.max_tokens,
            "temperature": self.temperature,
            "response_format": {"type": "json_object"}
        })
    }
}

#[async_trait]
impl Scorer for HttpScorer {
    async fn score(
        &self,
        credential: &Credential,
        request: &ScoreRequest,
    ) -> Result<ScoreResult, ScoreError> {
        let timer = Instant::now();
        let url = format!("{}/chat/completions", self.base_url);

        tracing::debug!(job_id = %request.job_id, credential = credential.id(), "Sending scoring request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(credential.api_key())
            .json(&self.payload(request))
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    ScoreError::Timeout(timer.elapsed())
                } else {
                    ScoreError::Upstream(err.to_string())
                }
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|err| {
            if err.is_timeout() {
                ScoreError::Timeout(timer.elapsed())
            } else {
                ScoreError::Upstream(err.to_string())
            }
        })?;

        if let Some(err) = classify_failure(status, &body) {
            return Err(err);
        }

        let mut result = parse_completion(&body)?;
        result.analysis["_metadata"] = json!({
            "duration_seconds": timer.elapsed().as_secs_f64(),
            "tokens_used": token_usage(&body),
            "model": self.model,
            "credential": credential.id(),
        });

        Ok(result)
    }
}

/// Maps a non-success response to an error. Quota exhaustion is reported as
/// a rate limit even when the provider does not use 429 for it.
pub(crate) fn classify_failure(status: StatusCode, body: &str) -> Option<ScoreError> {
    if status.is_success() {
        return None;
    }

    let excerpt = excerpt(body);
    if status == StatusCode::TOO_MANY_REQUESTS || mentions_quota(body) {
        return Some(ScoreError::RateLimited(format!("{status}: {excerpt}")));
    }

    Some(ScoreError::Upstream(format!("{status}: {excerpt}")))
}

fn mentions_quota(body: &str) -> bool {
    let lowered = body.to_ascii_lowercase();
    lowered.contains("resource_exhausted")
        || lowered.contains("rate_limit_exceeded")
        || lowered.contains("insufficient_quota")
        || lowered.contains("quota exceeded")
}

/// Extracts the graded JSON from a chat-completions body.
pub(crate) fn parse_completion(body: &str) -> Result<ScoreResult, ScoreError> {
    let envelope: Value = serde_json::from_str(body)
        .map_err(|err| ScoreError::Malformed(format!("response is not JSON: {err}")))?;

    let content = envelope
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .ok_or_else(|| ScoreError::Malformed("missing message content".to_string()))?;

    let analysis: Value = serde_json::from_str(strip_code_fence(content))
        .map_err(|err| ScoreError::Malformed(format!("content is not JSON: {err}")))?;

    let score = analysis
        .get("score")
        .and_then(Value::as_f64)
        .ok_or_else(|| ScoreError::Malformed("missing numeric score".to_string()))?;

    if !(0.0..=MAX_SCORE).contains(&score) {
        return Err(ScoreError::Malformed(format!("score {score} outside 0..={MAX_SCORE}")));
    }

    let feedback = analysis
        .get("feedback")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);

    Ok(ScoreResult { score, feedback, analysis })
}

fn token_usage(body: &str) -> Option<u64> {
    serde_json::from_str::<Value>(body)
        .ok()?
        .get("usage")
        .and_then(|usage| usage.get("total_tokens"))
        .and_then(Value::as_u64)
}

fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn excerpt(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= ERROR_EXCERPT_LIMIT {
        return trimmed.to_string();
    }
    let mut cut: String = trimmed.chars().take(ERROR_EXCERPT_LIMIT).collect();
    cut.push_str("...");
    cut
}
