use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const SUMMARY_SCHEMA_VERSION: i32 = 1;
pub const INSIGHT_SCHEMA_VERSION: i32 = 1;

// ---------------------------------------------------------------------------
// Closed vocabularies
// ---------------------------------------------------------------------------

/// Kind of a behavioral event. Unrecognised strings coming back from storage
/// land on `Unknown` so older binaries keep reading newer logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AiQuestion,
    AiFollowUp,
    CommunityAsk,
    CommunityAnswer,
    AssignmentSubmit,
    AssignmentResubmit,
    FeedbackView,
    ResourceView,
    #[serde(other)]
    Unknown,
}

pub const AI_TYPES: &[EventType] = &[EventType::AiQuestion, EventType::AiFollowUp];
pub const COMMUNITY_TYPES: &[EventType] = &[EventType::CommunityAsk, EventType::CommunityAnswer];
pub const SUBMISSION_TYPES: &[EventType] =
    &[EventType::AssignmentSubmit, EventType::AssignmentResubmit];

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::AiQuestion => "ai_question",
            EventType::AiFollowUp => "ai_follow_up",
            EventType::CommunityAsk => "community_ask",
            EventType::CommunityAnswer => "community_answer",
            EventType::AssignmentSubmit => "assignment_submit",
            EventType::AssignmentResubmit => "assignment_resubmit",
            EventType::FeedbackView => "feedback_view",
            EventType::ResourceView => "resource_view",
            EventType::Unknown => "unknown",
        }
    }

    /// Lenient parse used for stored rows.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "ai_question" => EventType::AiQuestion,
            "ai_follow_up" => EventType::AiFollowUp,
            "community_ask" => EventType::CommunityAsk,
            "community_answer" => EventType::CommunityAnswer,
            "assignment_submit" => EventType::AssignmentSubmit,
            "assignment_resubmit" => EventType::AssignmentResubmit,
            "feedback_view" => EventType::FeedbackView,
            "resource_view" => EventType::ResourceView,
            _ => EventType::Unknown,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Trailing window an aggregation covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RangeKey {
    #[default]
    #[serde(rename = "7d")]
    Days7,
    #[serde(rename = "30d")]
    Days30,
    #[serde(rename = "180d")]
    Days180,
    #[serde(rename = "365d")]
    Days365,
}

impl RangeKey {
    pub fn days(&self) -> i64 {
        match self {
            RangeKey::Days7 => 7,
            RangeKey::Days30 => 30,
            RangeKey::Days180 => 180,
            RangeKey::Days365 => 365,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RangeKey::Days7 => "7d",
            RangeKey::Days30 => "30d",
            RangeKey::Days180 => "180d",
            RangeKey::Days365 => "365d",
        }
    }
}

impl FromStr for RangeKey {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "7d" => Ok(RangeKey::Days7),
            "30d" => Ok(RangeKey::Days30),
            "180d" => Ok(RangeKey::Days180),
            "365d" => Ok(RangeKey::Days365),
            other => Err(format!(
                "unsupported range '{other}' (expected one of 7d, 30d, 180d, 365d)"
            )),
        }
    }
}

impl fmt::Display for RangeKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// The fixed set of ability dimensions every insight must cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbilityDimension {
    Inquiry,
    Collaboration,
    Iteration,
    SelfRegulation,
}

impl AbilityDimension {
    pub const ALL: [AbilityDimension; 4] = [
        AbilityDimension::Inquiry,
        AbilityDimension::Collaboration,
        AbilityDimension::Iteration,
        AbilityDimension::SelfRegulation,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            AbilityDimension::Inquiry => "inquiry",
            AbilityDimension::Collaboration => "collaboration",
            AbilityDimension::Iteration => "iteration",
            AbilityDimension::SelfRegulation => "self_regulation",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|dimension| dimension.code() == code.trim())
    }
}

/// Qualitative level attached to a stage judgement, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualitativeLevel {
    Emerging,
    Developing,
    Proficient,
    Extending,
}

impl QualitativeLevel {
    pub const LOWEST: QualitativeLevel = QualitativeLevel::Emerging;

    pub fn as_str(&self) -> &'static str {
        match self {
            QualitativeLevel::Emerging => "emerging",
            QualitativeLevel::Developing => "developing",
            QualitativeLevel::Proficient => "proficient",
            QualitativeLevel::Extending => "extending",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightStatus {
    Success,
    Partial,
    Failed,
}

impl InsightStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InsightStatus::Success => "success",
            InsightStatus::Partial => "partial",
            InsightStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> anyhow::Result<Self> {
        match value {
            "success" => Ok(InsightStatus::Success),
            "partial" => Ok(InsightStatus::Partial),
            "failed" => Ok(InsightStatus::Failed),
            other => anyhow::bail!("unknown insight status '{other}'"),
        }
    }
}

/// Who asked for an insight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerKind {
    #[serde(rename = "self")]
    SelfTrigger,
    #[serde(rename = "operator")]
    Operator,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::SelfTrigger => "self",
            TriggerKind::Operator => "operator",
        }
    }

    pub fn parse(value: &str) -> anyhow::Result<Self> {
        match value {
            "self" => Ok(TriggerKind::SelfTrigger),
            "operator" => Ok(TriggerKind::Operator),
            other => anyhow::bail!("unknown trigger '{other}'"),
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BehaviorEvent {
    pub id: i64,
    pub student_id: Uuid,
    pub course_id: Option<Uuid>,
    pub event_type: EventType,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl BehaviorEvent {
    /// Total order over events: timestamp first, id as tie-break.
    pub fn order_key(&self) -> (DateTime<Utc>, i64) {
        (self.occurred_at, self.id)
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

/// The (student, course, range) triple every snapshot and insight hangs off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InsightScope {
    pub student_id: Uuid,
    pub course_id: Option<Uuid>,
    pub range: RangeKey,
}

impl InsightScope {
    pub fn cache_key(&self) -> String {
        let course = self
            .course_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "all".to_string());
        format!("insight:latest:{}:{}:{}", self.student_id, course, self.range)
    }
}

// ---------------------------------------------------------------------------
// Stage 1 output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredSummary {
    pub schema_version: i32,
    pub student_id: Uuid,
    #[serde(default)]
    pub course_id: Option<Uuid>,
    #[serde(default)]
    pub range_key: RangeKey,
    pub period_from: DateTime<Utc>,
    pub period_to: DateTime<Utc>,
    pub input_event_count: usize,
    #[serde(default)]
    pub event_types_included: Vec<EventType>,
    #[serde(default)]
    pub activity_stats: ActivityStats,
    #[serde(default)]
    pub evidence_items: Vec<EvidenceItem>,
    #[serde(default)]
    pub non_evaluative: NonEvaluative,
    #[serde(default)]
    pub signals: TimeSignals,
}

impl StructuredSummary {
    pub fn evidence_ids(&self) -> impl Iterator<Item = &str> {
        self.evidence_items
            .iter()
            .map(|item| item.evidence_id.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ActivityStats {
    pub counts_by_type: BTreeMap<EventType, u64>,
    pub ai: AiStats,
    pub community: CommunityStats,
    pub assignment: AssignmentStats,
    pub feedback: FeedbackStats,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AiStats {
    pub question_count: u64,
    pub follow_up_count: u64,
    pub follow_up_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommunityStats {
    pub ask_count: u64,
    pub answer_count: u64,
    pub answer_share: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AssignmentStats {
    pub submit_count: u64,
    pub resubmit_count: u64,
    pub resubmit_after_feedback_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FeedbackStats {
    pub view_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceType {
    FeedbackIteration,
    AiInquiry,
    CommunityParticipation,
    AssignmentActivity,
    FeedbackEngagement,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceItem {
    pub evidence_id: String,
    pub evidence_type: EvidenceType,
    pub title: String,
    pub description: String,
    pub event_refs: Vec<i64>,
    pub occurred_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

/// Counts that must never feed an ability judgement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NonEvaluative {
    pub resource_view_count: u64,
    pub by_category: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeSignals {
    pub active_days: u32,
    pub max_daily_share: DailyShareSignals,
    pub bursts: BurstSignals,
    pub effective_counts_by_type: BTreeMap<EventType, u64>,
    pub daily_caps: BTreeMap<EventType, u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DailyShareSignals {
    pub all: f64,
    pub ai: f64,
    pub community: f64,
    pub submission: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BurstSignals {
    pub all: BurstSignal,
    pub ai: BurstSignal,
    pub submission: BurstSignal,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BurstSignal {
    pub window_minutes: i64,
    pub threshold: usize,
    pub max_in_window: usize,
    pub burst: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_start: Option<DateTime<Utc>>,
}

/// Persisted, immutable Stage 1 output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub id: i64,
    pub student_id: Uuid,
    pub course_id: Option<Uuid>,
    pub range_key: RangeKey,
    pub schema_version: i32,
    pub summary: StructuredSummary,
    pub generated_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn scope(&self) -> InsightScope {
        InsightScope {
            student_id: self.student_id,
            course_id: self.course_id,
            range: self.range_key,
        }
    }
}

// ---------------------------------------------------------------------------
// Stage 2 output
// ---------------------------------------------------------------------------

/// Free text backed by evidence ids from the owning snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GroundedStatement {
    pub text: String,
    pub evidence_refs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageJudgement {
    pub dimension: AbilityDimension,
    pub level: QualitativeLevel,
    pub rationale: String,
    #[serde(default)]
    pub evidence_refs: Vec<String>,
}

impl StageJudgement {
    pub fn insufficient(dimension: AbilityDimension) -> Self {
        Self {
            dimension,
            level: QualitativeLevel::LOWEST,
            rationale: INSUFFICIENT_EVIDENCE.to_string(),
            evidence_refs: Vec::new(),
        }
    }
}

pub const INSUFFICIENT_EVIDENCE: &str = "insufficient evidence";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FormativeSuggestion {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimension: Option<AbilityDimension>,
    pub evidence_refs: Vec<String>,
}

/// The model-authored part of an insight, stored as one JSON payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InsightBody {
    pub explain_score: GroundedStatement,
    pub stage_judgements: Vec<StageJudgement>,
    pub formative_suggestions: Vec<FormativeSuggestion>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub risk_alerts: Vec<GroundedStatement>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub action_recommendations: Vec<GroundedStatement>,
}

impl InsightBody {
    /// Body used whenever there is nothing the model may interpret.
    pub fn insufficient(text: impl Into<String>) -> Self {
        Self {
            explain_score: GroundedStatement {
                text: text.into(),
                evidence_refs: Vec::new(),
            },
            stage_judgements: AbilityDimension::ALL
                .into_iter()
                .map(StageJudgement::insufficient)
                .collect(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Insight {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub schema_version: i32,
    pub snapshot_id: i64,
    pub student_id: Uuid,
    pub course_id: Option<Uuid>,
    pub range_key: RangeKey,
    pub model: String,
    pub prompt_version: String,
    pub status: InsightStatus,
    pub trigger: TriggerKind,
    pub model_invoked: bool,
    #[serde(flatten)]
    pub body: InsightBody,
    pub generated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}
