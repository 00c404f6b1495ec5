//! In-memory stand-ins for Postgres and the model endpoint.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::ProviderError;
use crate::models::{
    BehaviorEvent, EventType, Insight, InsightScope, InsightStatus, Snapshot, StructuredSummary,
    INSIGHT_SCHEMA_VERSION,
};
use crate::provider::{GenerationOutput, GenerationRequest, TextGenerator};
use crate::store::{EventStore, InsightStore, SnapshotStore};

#[derive(Default)]
struct MemoryState {
    events: Vec<BehaviorEvent>,
    snapshots: Vec<Snapshot>,
    insights: Vec<Insight>,
    next_id: i64,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().expect("memory store poisoned")
    }

    pub fn add_event(
        &self,
        student_id: Uuid,
        course_id: Option<Uuid>,
        event_type: EventType,
        occurred_at: DateTime<Utc>,
    ) -> i64 {
        let mut state = self.state();
        let id = state.next_id();
        state.events.push(BehaviorEvent {
            id,
            student_id,
            course_id,
            event_type,
            occurred_at,
            metadata: Default::default(),
        });
        id
    }

    pub fn snapshots(&self) -> Vec<Snapshot> {
        self.state().snapshots.clone()
    }

    pub fn insights(&self) -> Vec<Insight> {
        self.state().insights.clone()
    }
}

fn in_scope(scope: &InsightScope, student_id: Uuid, course_id: Option<Uuid>) -> bool {
    student_id == scope.student_id && course_id == scope.course_id
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn fetch_events(
        &self,
        scope: &InsightScope,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        cap: usize,
    ) -> anyhow::Result<Vec<BehaviorEvent>> {
        let mut events: Vec<BehaviorEvent> = self
            .state()
            .events
            .iter()
            .filter(|event| event.student_id == scope.student_id)
            .filter(|event| scope.course_id.is_none() || event.course_id == scope.course_id)
            .filter(|event| event.occurred_at >= from && event.occurred_at <= to)
            .cloned()
            .collect();
        events.sort_by_key(|event| std::cmp::Reverse(event.order_key()));
        events.truncate(cap);
        events.reverse();
        Ok(events)
    }

    async fn has_events_after(
        &self,
        student_id: Uuid,
        course_id: Option<Uuid>,
        after: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        Ok(self.state().events.iter().any(|event| {
            event.student_id == student_id
                && (course_id.is_none() || event.course_id == course_id)
                && event.occurred_at > after
        }))
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn latest_snapshot(
        &self,
        scope: &InsightScope,
        schema_version: i32,
    ) -> anyhow::Result<Option<Snapshot>> {
        Ok(self
            .state()
            .snapshots
            .iter()
            .filter(|snapshot| in_scope(scope, snapshot.student_id, snapshot.course_id))
            .filter(|snapshot| snapshot.range_key == scope.range)
            .filter(|snapshot| snapshot.schema_version == schema_version)
            .max_by_key(|snapshot| (snapshot.generated_at, snapshot.id))
            .cloned())
    }

    async fn insert_snapshot(
        &self,
        summary: &StructuredSummary,
        generated_at: DateTime<Utc>,
    ) -> anyhow::Result<Snapshot> {
        let mut state = self.state();
        let snapshot = Snapshot {
            id: state.next_id(),
            student_id: summary.student_id,
            course_id: summary.course_id,
            range_key: summary.range_key,
            schema_version: summary.schema_version,
            summary: summary.clone(),
            generated_at,
        };
        state.snapshots.push(snapshot.clone());
        Ok(snapshot)
    }
}

#[async_trait]
impl InsightStore for MemoryStore {
    async fn insert_insight(&self, insight: &Insight) -> anyhow::Result<Insight> {
        let mut state = self.state();
        let mut stored = insight.clone();
        stored.id = Some(state.next_id());
        state.insights.push(stored.clone());
        Ok(stored)
    }

    async fn latest_for_snapshot(
        &self,
        snapshot_id: i64,
        statuses: &[InsightStatus],
    ) -> anyhow::Result<Option<Insight>> {
        Ok(self
            .state()
            .insights
            .iter()
            .filter(|insight| insight.snapshot_id == snapshot_id)
            .filter(|insight| insight.schema_version == INSIGHT_SCHEMA_VERSION)
            .filter(|insight| statuses.contains(&insight.status))
            .max_by_key(|insight| (insight.generated_at, insight.id))
            .cloned())
    }

    async fn latest_for_scope(
        &self,
        scope: &InsightScope,
        statuses: &[InsightStatus],
        since: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Option<Insight>> {
        Ok(self
            .state()
            .insights
            .iter()
            .filter(|insight| in_scope(scope, insight.student_id, insight.course_id))
            .filter(|insight| insight.range_key == scope.range)
            .filter(|insight| insight.schema_version == INSIGHT_SCHEMA_VERSION)
            .filter(|insight| statuses.contains(&insight.status))
            .filter(|insight| since.map_or(true, |since| insight.generated_at >= since))
            .max_by_key(|insight| (insight.generated_at, insight.id))
            .cloned())
    }

    async fn count_self_invocations_since(
        &self,
        student_id: Uuid,
        since: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        Ok(self
            .state()
            .insights
            .iter()
            .filter(|insight| insight.student_id == student_id)
            .filter(|insight| insight.trigger == crate::models::TriggerKind::SelfTrigger)
            .filter(|insight| insight.model_invoked && insight.generated_at >= since)
            .count() as u64)
    }
}

type Responder = Box<dyn Fn(&GenerationRequest) -> Result<String, ProviderError> + Send + Sync>;

/// Text generator that answers from a closure and counts its calls.
pub struct ScriptedGenerator {
    responder: Responder,
    calls: AtomicUsize,
    last_payload: Mutex<Option<String>>,
}

impl ScriptedGenerator {
    pub fn new(
        responder: impl Fn(&GenerationRequest) -> Result<String, ProviderError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            responder: Box::new(responder),
            calls: AtomicUsize::new(0),
            last_payload: Mutex::new(None),
        }
    }

    /// Answers with judgements that cite the evidence in the request payload.
    pub fn grounded() -> Self {
        Self::new(|request| Ok(grounded_response(&request.payload)))
    }

    pub fn always(content: impl Into<String>) -> Self {
        let content = content.into();
        Self::new(move |_| Ok(content.clone()))
    }

    pub fn failing(error: ProviderError) -> Self {
        Self::new(move |_| Err(error.clone()))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_payload(&self) -> Option<String> {
        self.last_payload.lock().expect("payload lock poisoned").clone()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_payload.lock().expect("payload lock poisoned") = Some(request.payload.clone());
        (self.responder)(request).map(|content| GenerationOutput {
            content,
            model: request.model.clone(),
            usage: None,
        })
    }
}

/// Model output citing the first evidence item of the payload's summary for
/// every dimension.
pub fn grounded_response(payload: &str) -> String {
    let parsed: Value = serde_json::from_str(payload).unwrap_or(Value::Null);
    let first_id = parsed["summary"]["evidenceItems"]
        .get(0)
        .and_then(|item| item["evidenceId"].as_str())
        .map(|id| vec![id.to_string()])
        .unwrap_or_default();

    json!({
        "explainScore": {"text": "Activity is consistent and grounded.", "evidenceRefs": first_id},
        "stageJudgements": [
            {"dimension": "inquiry", "level": "developing", "rationale": "Asks questions.", "evidenceRefs": first_id},
            {"dimension": "collaboration", "level": "emerging", "rationale": "Little peer activity.", "evidenceRefs": []},
            {"dimension": "iteration", "level": "developing", "rationale": "Some revision.", "evidenceRefs": first_id},
            {"dimension": "self_regulation", "level": "developing", "rationale": "Regular pace.", "evidenceRefs": []}
        ],
        "formativeSuggestions": [
            {"text": "Ask one follow-up per question.", "dimension": "inquiry", "evidenceRefs": first_id}
        ]
    })
    .to_string()
}
