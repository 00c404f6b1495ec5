//! The two operations callers see: Generate and Get Latest.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::Cache;
use crate::error::{PipelineError, PipelineResult};
use crate::generator::InsightGenerator;
use crate::governor::{CooldownInfo, Decision, Governor, QuotaInfo, TriggerMode, INTERPRETED};
use crate::models::{Insight, InsightScope, RangeKey, Snapshot};
use crate::snapshot::{CurrentSnapshot, SnapshotManager};
use crate::store::InsightStore;

const COOLDOWN_TEXT: &str =
    "daily insight limit reached and no earlier insight is stored for this period";
const ROTATED_NOTICE: &str =
    "a newer activity summary exists and has not been interpreted yet; showing the most recent insight";

/// Identity and range of a request, as received from the caller.
#[derive(Debug, Clone)]
pub struct ScopeParams {
    pub student_id: Uuid,
    pub course_id: Option<Uuid>,
    pub range: String,
}

impl ScopeParams {
    pub fn resolve(&self) -> PipelineResult<InsightScope> {
        if self.student_id.is_nil() {
            return Err(PipelineError::InvalidParameter(
                "studentId is required".to_string(),
            ));
        }
        let range = self
            .range
            .trim()
            .parse::<RangeKey>()
            .map_err(PipelineError::InvalidParameter)?;
        Ok(InsightScope {
            student_id: self.student_id,
            course_id: self.course_id,
            range,
        })
    }
}

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub scope: ScopeParams,
    pub model: Option<String>,
    pub force: bool,
    pub self_trigger: bool,
}

impl GenerateRequest {
    fn mode(&self) -> PipelineResult<TriggerMode> {
        match (self.self_trigger, self.force) {
            (true, true) => Err(PipelineError::InvalidParameter(
                "force cannot be combined with selfTrigger".to_string(),
            )),
            (true, false) => Ok(TriggerMode::SelfTrigger),
            (false, force) => Ok(TriggerMode::Operator { force }),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResponseExtra {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<QuotaInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown: Option<CooldownInfo>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub reused: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newer_snapshot_id: Option<i64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub snapshot_stale: bool,
}

impl ResponseExtra {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// An insight as returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightResponse {
    #[serde(flatten)]
    pub insight: Insight,
    #[serde(default, skip_serializing_if = "ResponseExtra::is_empty")]
    pub extra: ResponseExtra,
}

impl InsightResponse {
    fn new(insight: Insight, extra: ResponseExtra) -> Self {
        Self { insight, extra }
    }
}

pub struct InsightService {
    snapshots: SnapshotManager,
    insights: Arc<dyn InsightStore>,
    generator: InsightGenerator,
    governor: Governor,
    cache: Arc<dyn Cache>,
    latest_ttl: Duration,
}

impl InsightService {
    pub fn new(
        snapshots: SnapshotManager,
        insights: Arc<dyn InsightStore>,
        generator: InsightGenerator,
        governor: Governor,
        cache: Arc<dyn Cache>,
        latest_ttl: Duration,
    ) -> Self {
        Self {
            snapshots,
            insights,
            generator,
            governor,
            cache,
            latest_ttl,
        }
    }

    /// Current summary for a scope, recomputed when stale or when `refresh`
    /// is set.
    pub async fn summary(&self, params: &ScopeParams, refresh: bool) -> PipelineResult<Snapshot> {
        self.summary_at(params, refresh, Utc::now()).await
    }

    pub async fn summary_at(
        &self,
        params: &ScopeParams,
        refresh: bool,
        now: DateTime<Utc>,
    ) -> PipelineResult<Snapshot> {
        let scope = params.resolve()?;
        self.current_snapshot(&scope, refresh, now).await
    }

    /// Any newly written snapshot invalidates the scope's cached Get Latest
    /// response, whose rotation notice depends on the latest snapshot.
    async fn current_snapshot(
        &self,
        scope: &InsightScope,
        refresh: bool,
        now: DateTime<Utc>,
    ) -> PipelineResult<Snapshot> {
        let current = if refresh {
            CurrentSnapshot {
                snapshot: self.snapshots.build_and_save_snapshot(scope, now).await?,
                rebuilt: true,
            }
        } else {
            self.snapshots.get_or_build_summary(scope, now).await?
        };
        if current.rebuilt {
            self.cache.delete(&scope.cache_key());
        }
        Ok(current.snapshot)
    }

    pub async fn generate(&self, request: &GenerateRequest) -> PipelineResult<InsightResponse> {
        self.generate_at(request, Utc::now()).await
    }

    pub async fn generate_at(
        &self,
        request: &GenerateRequest,
        now: DateTime<Utc>,
    ) -> PipelineResult<InsightResponse> {
        let scope = request.scope.resolve()?;
        let mode = request.mode()?;
        let trigger = mode.kind();

        let snapshot = self.current_snapshot(&scope, false, now).await?;

        let quota = match mode {
            TriggerMode::SelfTrigger => Some(self.governor.quota(scope.student_id, now).await?),
            TriggerMode::Operator { .. } => None,
        };

        if snapshot.summary.evidence_items.is_empty() {
            let insight = self.generator.degraded(&snapshot, trigger, now).await?;
            self.cache.delete(&scope.cache_key());
            return Ok(InsightResponse::new(
                insight,
                ResponseExtra {
                    quota,
                    ..ResponseExtra::default()
                },
            ));
        }

        let decision = self
            .governor
            .decide(&snapshot, mode, quota.as_ref(), now)
            .await?;

        let response = match decision {
            Decision::Reuse(insight) => {
                info!(
                    student_id = %scope.student_id,
                    insight_id = ?insight.id,
                    trigger = trigger.as_str(),
                    "Reusing stored insight"
                );
                InsightResponse::new(
                    insight,
                    ResponseExtra {
                        quota,
                        reused: true,
                        ..ResponseExtra::default()
                    },
                )
            }
            Decision::Cooldown { fallback, cooldown } => {
                let insight = fallback.unwrap_or_else(|| {
                    self.generator
                        .placeholder(&snapshot, trigger, COOLDOWN_TEXT, now)
                });
                InsightResponse::new(
                    insight,
                    ResponseExtra {
                        quota,
                        cooldown: Some(cooldown),
                        ..ResponseExtra::default()
                    },
                )
            }
            Decision::Invoke => {
                let generated = self
                    .generator
                    .generate(&snapshot, request.model.as_deref(), trigger, now)
                    .await;
                self.cache.delete(&scope.cache_key());
                let insight = generated?;
                let quota = quota.map(|quota| {
                    if insight.model_invoked {
                        quota.consumed()
                    } else {
                        quota
                    }
                });
                InsightResponse::new(
                    insight,
                    ResponseExtra {
                        quota,
                        ..ResponseExtra::default()
                    },
                )
            }
        };
        Ok(response)
    }

    pub async fn get_latest(&self, params: &ScopeParams) -> PipelineResult<Option<InsightResponse>> {
        let scope = params.resolve()?;
        let key = scope.cache_key();

        if let Some(cached) = self.cache.get(&key) {
            match serde_json::from_value::<InsightResponse>(cached) {
                Ok(response) => {
                    debug!(cache_key = %key, "Latest insight served from cache");
                    return Ok(Some(response));
                }
                Err(error) => {
                    warn!(cache_key = %key, %error, "Dropping unreadable cache entry");
                    self.cache.delete(&key);
                }
            }
        }

        let Some(response) = self.find_latest(&scope).await? else {
            return Ok(None);
        };

        match serde_json::to_value(&response) {
            Ok(value) => self.cache.set_with_ttl(&key, value, self.latest_ttl),
            Err(error) => warn!(cache_key = %key, %error, "Latest insight not cached"),
        }
        Ok(Some(response))
    }

    async fn find_latest(&self, scope: &InsightScope) -> PipelineResult<Option<InsightResponse>> {
        let snapshot = self.snapshots.latest(scope).await?;

        if let Some(snapshot) = &snapshot {
            if let Some(insight) = self
                .insights
                .latest_for_snapshot(snapshot.id, INTERPRETED)
                .await?
            {
                let snapshot_stale = self.snapshots.is_stale(snapshot).await?;
                return Ok(Some(InsightResponse::new(
                    insight,
                    ResponseExtra {
                        snapshot_stale,
                        ..ResponseExtra::default()
                    },
                )));
            }
        }

        let Some(insight) = self.insights.latest_for_scope(scope, INTERPRETED, None).await? else {
            return Ok(None);
        };

        let newer_snapshot_id = snapshot
            .map(|snapshot| snapshot.id)
            .filter(|id| *id != insight.snapshot_id);
        let notice = newer_snapshot_id.map(|_| ROTATED_NOTICE.to_string());
        Ok(Some(InsightResponse::new(
            insight,
            ResponseExtra {
                notice,
                newer_snapshot_id,
                ..ResponseExtra::default()
            },
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::Aggregator;
    use crate::cache::MemoryCache;
    use crate::error::{GroundingViolation, ProviderError};
    use crate::governor::QuotaPolicy;
    use crate::models::{EventType, InsightStatus};
    use crate::snapshot::DEFAULT_EVENT_CAP;
    use crate::testing::{MemoryStore, ScriptedGenerator};
    use chrono::TimeZone;
    use serde_json::json;

    struct Harness {
        store: Arc<MemoryStore>,
        provider: Arc<ScriptedGenerator>,
        cache: Arc<MemoryCache>,
        service: InsightService,
    }

    fn harness(provider: ScriptedGenerator, limit_per_day: u32) -> Harness {
        let store = Arc::new(MemoryStore::default());
        let provider = Arc::new(provider);
        let cache = Arc::new(MemoryCache::new());
        let service = InsightService::new(
            SnapshotManager::new(
                store.clone(),
                store.clone(),
                Aggregator::default(),
                DEFAULT_EVENT_CAP,
            ),
            store.clone(),
            InsightGenerator::new(provider.clone(), store.clone(), "gpt-4o-mini", 0.2),
            Governor::new(
                store.clone(),
                QuotaPolicy {
                    limit_per_day,
                    ..QuotaPolicy::default()
                },
            ),
            cache.clone(),
            Duration::from_secs(60),
        );
        Harness {
            store,
            provider,
            cache,
            service,
        }
    }

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 8, 10, 0, 0).unwrap()
    }

    fn params(student_id: Uuid) -> ScopeParams {
        ScopeParams {
            student_id,
            course_id: None,
            range: "7d".to_string(),
        }
    }

    fn request(student_id: Uuid, self_trigger: bool, force: bool) -> GenerateRequest {
        GenerateRequest {
            scope: params(student_id),
            model: None,
            force,
            self_trigger,
        }
    }

    #[tokio::test]
    async fn invalid_parameters_write_nothing() {
        let h = harness(ScriptedGenerator::grounded(), 7);

        let nil = h.service.generate_at(&request(Uuid::nil(), true, false), base()).await;
        assert!(matches!(nil, Err(PipelineError::InvalidParameter(_))));

        let mut bad_range = request(Uuid::new_v4(), true, false);
        bad_range.scope.range = "14d".to_string();
        let bad = h.service.generate_at(&bad_range, base()).await;
        assert!(matches!(bad, Err(PipelineError::InvalidParameter(_))));

        let both = h.service.generate_at(&request(Uuid::new_v4(), true, true), base()).await;
        assert!(matches!(both, Err(PipelineError::InvalidParameter(_))));

        assert!(h.store.snapshots().is_empty());
        assert!(h.store.insights().is_empty());
        assert_eq!(h.provider.calls(), 0);
    }

    #[tokio::test]
    async fn no_evidence_degrades_without_spending_quota() {
        let h = harness(ScriptedGenerator::grounded(), 7);
        let student = Uuid::new_v4();

        for minute in 0..3 {
            let response = h
                .service
                .generate_at(&request(student, true, false), base() + chrono::Duration::minutes(minute))
                .await
                .unwrap();
            assert_eq!(response.insight.status, InsightStatus::Partial);
            assert!(!response.insight.model_invoked);
            assert_eq!(response.extra.quota.unwrap().used_today, 0);
        }
        assert_eq!(h.provider.calls(), 0);
    }

    #[tokio::test]
    async fn eighth_self_trigger_of_the_day_cools_down() {
        let h = harness(ScriptedGenerator::grounded(), 7);
        let student = Uuid::new_v4();

        let mut last_id = None;
        for i in 0..7 {
            let now = base() + chrono::Duration::minutes(i);
            h.store.add_event(student, None, EventType::AiQuestion, now - chrono::Duration::seconds(30));
            let response = h
                .service
                .generate_at(&request(student, true, false), now)
                .await
                .unwrap();
            assert_eq!(response.insight.status, InsightStatus::Success);
            assert_eq!(response.extra.quota.as_ref().unwrap().used_today, i as u64 + 1);
            assert!(response.extra.cooldown.is_none());
            last_id = response.insight.id;
        }
        assert_eq!(h.provider.calls(), 7);

        let now = base() + chrono::Duration::minutes(7);
        h.store.add_event(student, None, EventType::AiQuestion, now - chrono::Duration::seconds(30));
        let response = h
            .service
            .generate_at(&request(student, true, false), now)
            .await
            .unwrap();

        assert_eq!(h.provider.calls(), 7);
        let cooldown = response.extra.cooldown.unwrap();
        assert!(cooldown.active);
        let quota = response.extra.quota.unwrap();
        assert_eq!(quota.used_today, 7);
        assert_eq!(quota.remaining, 0);
        assert_eq!(quota.reset_at, Utc.with_ymd_and_hms(2026, 3, 9, 0, 0, 0).unwrap());
        assert_eq!(response.insight.id, last_id);
    }

    #[tokio::test]
    async fn cooldown_without_history_returns_placeholder() {
        let h = harness(ScriptedGenerator::grounded(), 0);
        let student = Uuid::new_v4();
        h.store.add_event(student, None, EventType::CommunityAnswer, base() - chrono::Duration::hours(1));

        let response = h
            .service
            .generate_at(&request(student, true, false), base())
            .await
            .unwrap();
        assert_eq!(h.provider.calls(), 0);
        assert!(response.insight.id.is_none());
        assert_eq!(response.insight.body.explain_score.text, COOLDOWN_TEXT);
        assert_eq!(response.insight.body.stage_judgements.len(), 4);
        assert!(response.extra.cooldown.is_some());
        assert!(h.store.insights().is_empty());
    }

    #[tokio::test]
    async fn self_trigger_reuses_insight_for_unchanged_snapshot() {
        let h = harness(ScriptedGenerator::grounded(), 7);
        let student = Uuid::new_v4();
        h.store.add_event(student, None, EventType::AiQuestion, base() - chrono::Duration::hours(1));

        let first = h.service.generate_at(&request(student, true, false), base()).await.unwrap();
        let second = h
            .service
            .generate_at(&request(student, true, false), base() + chrono::Duration::minutes(5))
            .await
            .unwrap();

        assert_eq!(h.provider.calls(), 1);
        assert_eq!(first.insight.id, second.insight.id);
        assert!(second.extra.reused);
        assert_eq!(second.extra.quota.unwrap().used_today, 1);
    }

    #[tokio::test]
    async fn operator_reuses_until_forced() {
        let h = harness(ScriptedGenerator::grounded(), 7);
        let student = Uuid::new_v4();
        h.store.add_event(student, None, EventType::AssignmentSubmit, base() - chrono::Duration::days(1));

        let first = h.service.generate_at(&request(student, false, false), base()).await.unwrap();
        assert!(first.extra.quota.is_none());
        let reused = h.service.generate_at(&request(student, false, false), base()).await.unwrap();
        assert!(reused.extra.reused);
        assert_eq!(h.provider.calls(), 1);

        let forced = h.service.generate_at(&request(student, false, true), base()).await.unwrap();
        assert!(!forced.extra.reused);
        assert_ne!(forced.insight.id, first.insight.id);
        assert_eq!(h.provider.calls(), 2);
    }

    #[tokio::test]
    async fn grounding_violation_fails_the_request_and_is_recorded() {
        let h = harness(
            ScriptedGenerator::always(
                json!({"explainScore": {"text": "ok", "evidenceRefs": ["ev_19990101_1"]}}).to_string(),
            ),
            7,
        );
        let student = Uuid::new_v4();
        h.store.add_event(student, None, EventType::AiQuestion, base() - chrono::Duration::hours(2));

        let err = h
            .service
            .generate_at(&request(student, false, false), base())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Grounding(GroundingViolation::UnknownEvidence { .. })
        ));
        assert_eq!(h.store.insights()[0].status, InsightStatus::Failed);
        assert!(h.service.get_latest(&params(student)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upstream_failure_is_a_response_not_an_error() {
        let h = harness(ScriptedGenerator::failing(ProviderError::from_status(429, "slow down")), 7);
        let student = Uuid::new_v4();
        h.store.add_event(student, None, EventType::AiQuestion, base() - chrono::Duration::hours(2));

        let response = h
            .service
            .generate_at(&request(student, true, false), base())
            .await
            .unwrap();
        assert_eq!(response.insight.status, InsightStatus::Failed);
        assert!(response.insight.error_message.is_some());
        assert!(h.service.get_latest(&params(student)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn latest_is_none_before_any_generation() {
        let h = harness(ScriptedGenerator::grounded(), 7);
        assert!(h.service.get_latest(&params(Uuid::new_v4())).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn latest_is_cached_and_generate_invalidates_it() {
        let h = harness(ScriptedGenerator::grounded(), 7);
        let student = Uuid::new_v4();
        h.store.add_event(student, None, EventType::AiQuestion, base() - chrono::Duration::hours(2));
        let generated = h.service.generate_at(&request(student, false, false), base()).await.unwrap();

        let key = params(student).resolve().unwrap().cache_key();
        let latest = h.service.get_latest(&params(student)).await.unwrap().unwrap();
        assert_eq!(latest.insight.id, generated.insight.id);
        assert!(h.cache.get(&key).is_some());

        let from_cache = h.service.get_latest(&params(student)).await.unwrap().unwrap();
        assert_eq!(from_cache, latest);

        h.service.generate_at(&request(student, false, true), base()).await.unwrap();
        assert!(h.cache.get(&key).is_none());
    }

    #[tokio::test]
    async fn latest_falls_back_when_snapshot_rotated() {
        let h = harness(ScriptedGenerator::grounded(), 7);
        let student = Uuid::new_v4();
        h.store.add_event(student, None, EventType::AiQuestion, base() - chrono::Duration::hours(2));
        let generated = h.service.generate_at(&request(student, false, false), base()).await.unwrap();

        let later = base() + chrono::Duration::minutes(10);
        h.store.add_event(student, None, EventType::AiFollowUp, later - chrono::Duration::minutes(1));
        let rotated = h.service.summary_at(&params(student), false, later).await.unwrap();
        assert_ne!(rotated.id, generated.insight.snapshot_id);

        let latest = h.service.get_latest(&params(student)).await.unwrap().unwrap();
        assert_eq!(latest.insight.id, generated.insight.id);
        assert_eq!(latest.extra.newer_snapshot_id, Some(rotated.id));
        assert!(latest.extra.notice.is_some());
    }

    #[tokio::test]
    async fn refreshed_summary_invalidates_cached_latest() {
        let h = harness(ScriptedGenerator::grounded(), 7);
        let student = Uuid::new_v4();
        h.store.add_event(student, None, EventType::AiQuestion, base() - chrono::Duration::hours(2));
        h.service.generate_at(&request(student, false, false), base()).await.unwrap();

        let cached = h.service.get_latest(&params(student)).await.unwrap().unwrap();
        assert!(cached.extra.newer_snapshot_id.is_none());
        let key = params(student).resolve().unwrap().cache_key();
        assert!(h.cache.get(&key).is_some());

        let rotated = h
            .service
            .summary_at(&params(student), true, base() + chrono::Duration::minutes(1))
            .await
            .unwrap();
        assert!(h.cache.get(&key).is_none());

        let latest = h.service.get_latest(&params(student)).await.unwrap().unwrap();
        assert_eq!(latest.extra.newer_snapshot_id, Some(rotated.id));
        assert!(latest.extra.notice.is_some());
    }

    #[tokio::test]
    async fn current_summary_keeps_cached_latest() {
        let h = harness(ScriptedGenerator::grounded(), 7);
        let student = Uuid::new_v4();
        h.store.add_event(student, None, EventType::AiQuestion, base() - chrono::Duration::hours(2));
        h.service.generate_at(&request(student, false, false), base()).await.unwrap();
        h.service.get_latest(&params(student)).await.unwrap();

        let key = params(student).resolve().unwrap().cache_key();
        h.service
            .summary_at(&params(student), false, base() + chrono::Duration::minutes(1))
            .await
            .unwrap();
        assert!(h.cache.get(&key).is_some());
    }

    #[test]
    fn response_flattens_insight_and_omits_empty_extra() {
        let insight: Insight = serde_json::from_value(json!({
            "schemaVersion": 1,
            "snapshotId": 3,
            "studentId": Uuid::nil(),
            "courseId": null,
            "rangeKey": "7d",
            "model": "none",
            "promptVersion": "p",
            "status": "partial",
            "trigger": "self",
            "modelInvoked": false,
            "generatedAt": "2026-03-08T10:00:00Z"
        }))
        .unwrap();

        let plain = serde_json::to_value(InsightResponse::new(insight.clone(), ResponseExtra::default())).unwrap();
        assert_eq!(plain["snapshotId"], json!(3));
        assert!(plain.get("extra").is_none());

        let annotated = serde_json::to_value(InsightResponse::new(
            insight,
            ResponseExtra {
                reused: true,
                ..ResponseExtra::default()
            },
        ))
        .unwrap();
        assert_eq!(annotated["extra"], json!({"reused": true}));
    }
}
