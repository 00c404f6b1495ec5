//! Stage 2: one structured-output model call per insight, fed nothing but a
//! snapshot, with every outcome persisted.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{PipelineError, PipelineResult, ProviderError, ProviderErrorKind};
use crate::models::{
    Insight, InsightBody, InsightStatus, Snapshot, StructuredSummary, TriggerKind,
    INSIGHT_SCHEMA_VERSION,
};
use crate::provider::{GenerationRequest, TextGenerator};
use crate::store::InsightStore;
use crate::validator::{self, ValidationError};

pub const PROMPT_VERSION: &str = "behavior-insight-v1";

/// Model name recorded on insights that never reached a model.
pub const NO_MODEL: &str = "none";

pub const SYSTEM_PROMPT: &str = r#"You interpret a structured summary of a student's learning activity.
The summary is the only information you have. Respond with a single JSON object and nothing else:
{
  "explainScore": {"text": string, "evidenceRefs": [evidenceId]},
  "stageJudgements": [{"dimension": "inquiry"|"collaboration"|"iteration"|"self_regulation",
                       "level": "emerging"|"developing"|"proficient"|"extending",
                       "rationale": string, "evidenceRefs": [evidenceId]}],
  "formativeSuggestions": [{"text": string, "dimension": string, "evidenceRefs": [evidenceId]}],
  "riskAlerts": [{"text": string, "evidenceRefs": [evidenceId]}],
  "actionRecommendations": [{"text": string, "evidenceRefs": [evidenceId]}]
}
Rules:
- Cite only evidenceId values that appear in summary.evidenceItems.
- Give exactly one judgement per dimension; use "emerging" with rationale "insufficient evidence" when nothing supports it.
- Never output numbers that grade the student: no scores, weights, percentages, ranks, averages or GPA, under any key.
- nonEvaluative counts and signals are context only and must not justify a level."#;

const INSUFFICIENT_EVIDENCE_TEXT: &str =
    "insufficient evidence: no activity in this period could be cited, so no interpretation was generated";
const UNAVAILABLE_TEXT: &str = "insight unavailable";

/// The only thing sent to the model.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PromptPayload<'a> {
    snapshot_id: i64,
    generated_at: DateTime<Utc>,
    summary: &'a StructuredSummary,
}

pub struct InsightGenerator {
    provider: Arc<dyn TextGenerator>,
    insights: Arc<dyn InsightStore>,
    default_model: String,
    temperature: f32,
}

impl InsightGenerator {
    pub fn new(
        provider: Arc<dyn TextGenerator>,
        insights: Arc<dyn InsightStore>,
        default_model: impl Into<String>,
        temperature: f32,
    ) -> Self {
        Self {
            provider,
            insights,
            default_model: default_model.into(),
            temperature,
        }
    }

    fn base_insight(
        &self,
        snapshot: &Snapshot,
        model: &str,
        trigger: TriggerKind,
        now: DateTime<Utc>,
    ) -> Insight {
        Insight {
            id: None,
            schema_version: INSIGHT_SCHEMA_VERSION,
            snapshot_id: snapshot.id,
            student_id: snapshot.student_id,
            course_id: snapshot.course_id,
            range_key: snapshot.range_key,
            model: model.to_string(),
            prompt_version: PROMPT_VERSION.to_string(),
            status: InsightStatus::Partial,
            trigger,
            model_invoked: false,
            body: InsightBody::default(),
            generated_at: now,
            error_message: None,
        }
    }

    /// Partial result with placeholder judgements for every dimension. Not
    /// persisted.
    pub fn placeholder(
        &self,
        snapshot: &Snapshot,
        trigger: TriggerKind,
        explanation: &str,
        now: DateTime<Utc>,
    ) -> Insight {
        let mut insight = self.base_insight(snapshot, NO_MODEL, trigger, now);
        insight.body = InsightBody::insufficient(explanation);
        insight
    }

    /// Persisted degraded result; the model is never called.
    pub async fn degraded(
        &self,
        snapshot: &Snapshot,
        trigger: TriggerKind,
        now: DateTime<Utc>,
    ) -> PipelineResult<Insight> {
        let insight = self.placeholder(snapshot, trigger, INSUFFICIENT_EVIDENCE_TEXT, now);
        info!(snapshot_id = snapshot.id, "No evidence in snapshot, returning degraded insight");
        Ok(self.insights.insert_insight(&insight).await?)
    }

    pub fn build_request(&self, snapshot: &Snapshot, model: Option<&str>) -> PipelineResult<GenerationRequest> {
        let payload = serde_json::to_string(&PromptPayload {
            snapshot_id: snapshot.id,
            generated_at: snapshot.generated_at,
            summary: &snapshot.summary,
        })
        .map_err(anyhow::Error::from)?;

        Ok(GenerationRequest {
            model: model
                .map(str::trim)
                .filter(|model| !model.is_empty())
                .unwrap_or(&self.default_model)
                .to_string(),
            system_prompt: SYSTEM_PROMPT.to_string(),
            payload,
            temperature: self.temperature,
        })
    }

    /// Produce and persist an insight for `snapshot`.
    ///
    /// Upstream and parse failures come back as a persisted `failed` insight.
    /// Grounding violations are persisted as `failed` too, and then returned
    /// as an error.
    pub async fn generate(
        &self,
        snapshot: &Snapshot,
        model: Option<&str>,
        trigger: TriggerKind,
        now: DateTime<Utc>,
    ) -> PipelineResult<Insight> {
        if snapshot.summary.evidence_items.is_empty() {
            return self.degraded(snapshot, trigger, now).await;
        }

        let request = self.build_request(snapshot, model)?;
        let requested_model = request.model.clone();

        // Detached so that a caller giving up does not abort the call itself.
        let provider = Arc::clone(&self.provider);
        let call = tokio::spawn(async move { provider.generate(&request).await });
        let output = match call.await {
            Ok(result) => result,
            Err(join_error) => Err(ProviderError {
                kind: ProviderErrorKind::Unknown,
                status: None,
                message: format!("generation task ended abnormally: {join_error}"),
            }),
        };

        let output = match output {
            Ok(output) => output,
            Err(error) => {
                warn!(snapshot_id = snapshot.id, error = %error, "Text generation failed");
                let failed = self.failed(snapshot, &requested_model, trigger, now, error.to_string());
                return Ok(self.insights.insert_insight(&failed).await?);
            }
        };

        match validator::validate(&output.content, &snapshot.summary) {
            Ok(validated) => {
                let mut insight = self.base_insight(snapshot, &output.model, trigger, now);
                insight.model_invoked = true;
                insight.status = if validated.synthesized.is_empty() {
                    InsightStatus::Success
                } else {
                    InsightStatus::Partial
                };
                insight.body = validated.body;
                let stored = self.insights.insert_insight(&insight).await?;
                info!(
                    snapshot_id = snapshot.id,
                    insight_id = ?stored.id,
                    status = stored.status.as_str(),
                    synthesized = validated.synthesized.len(),
                    "Insight generated"
                );
                Ok(stored)
            }
            Err(ValidationError::Malformed(message)) => {
                warn!(snapshot_id = snapshot.id, %message, "Model output could not be parsed");
                let failed = self.failed(snapshot, &output.model, trigger, now, message);
                Ok(self.insights.insert_insight(&failed).await?)
            }
            Err(ValidationError::Grounding(violation)) => {
                warn!(snapshot_id = snapshot.id, %violation, "Model output violated evidence grounding");
                let failed =
                    self.failed(snapshot, &output.model, trigger, now, violation.to_string());
                self.insights.insert_insight(&failed).await?;
                Err(PipelineError::Grounding(violation))
            }
        }
    }

    fn failed(
        &self,
        snapshot: &Snapshot,
        model: &str,
        trigger: TriggerKind,
        now: DateTime<Utc>,
        message: String,
    ) -> Insight {
        let mut insight = self.base_insight(snapshot, model, trigger, now);
        insight.status = InsightStatus::Failed;
        insight.model_invoked = true;
        insight.body.explain_score.text = UNAVAILABLE_TEXT.to_string();
        insight.error_message = Some(message);
        insight
    }
}
