use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::grading::credentials::Credential;
use crate::grading::scorer::{ScoreError, ScoreRequest, ScoreResult, Scorer};

#[derive(Debug, Clone)]
pub(crate) enum Step {
    Succeed(f64),
    RateLimited,
    Fail,
    /// Sleeps, then succeeds.
    Delay(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ScoreCall {
    pub(crate) job_id: String,
    pub(crate) credential_id: String,
}

/// Plays back queued steps in call order, then repeats the default step.
pub(crate) struct ScriptedScorer {
    steps: Mutex<VecDeque<Step>>,
    default: Step,
    calls: Mutex<Vec<ScoreCall>>,
}

impl ScriptedScorer {
    pub(crate) fn with_default(default: Step) -> Self {
        Self { steps: Mutex::new(VecDeque::new()), default, calls: Mutex::new(Vec::new()) }
    }

    pub(crate) fn succeeding() -> Self {
        Self::with_default(Step::Succeed(80.0))
    }

    pub(crate) fn failing() -> Self {
        Self::with_default(Step::Fail)
    }

    pub(crate) fn with_steps(steps: impl IntoIterator<Item = Step>) -> Self {
        let scorer = Self::succeeding();
        scorer.steps.lock().expect("steps lock").extend(steps);
        scorer
    }

    pub(crate) fn calls(&self) -> Vec<ScoreCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub(crate) fn job_ids(&self) -> Vec<String> {
        self.calls().into_iter().map(|call| call.job_id).collect()
    }

    fn next_step(&self) -> Step {
        self.steps.lock().expect("steps lock").pop_front().unwrap_or_else(|| self.default.clone())
    }
}

fn graded(score: f64) -> ScoreResult {
    ScoreResult {
        score,
        feedback: Some("Covered the key artifacts.".to_string()),
        analysis: json!({"score": score, "matched_points": ["timeline"]}),
    }
}

#[async_trait]
impl Scorer for ScriptedScorer {
    async fn score(
        &self,
        credential: &Credential,
        request: &ScoreRequest,
    ) -> Result<ScoreResult, ScoreError> {
        self.calls.lock().expect("calls lock").push(ScoreCall {
            job_id: request.job_id.clone(),
            credential_id: credential.id().to_string(),
        });

        match self.next_step() {
            Step::Succeed(score) => Ok(graded(score)),
            Step::RateLimited => Err(ScoreError::RateLimited("429: slow down".to_string())),
            Step::Fail => Err(ScoreError::Upstream("502: upstream unavailable".to_string())),
            Step::Delay(duration) => {
                tokio::time::sleep(duration).await;
                Ok(graded(80.0))
            }
        }
    }
}
