use std::collections::BTreeMap;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{
    BehaviorEvent, EventType, Insight, InsightBody, InsightScope, InsightStatus, RangeKey,
    Snapshot, StructuredSummary, TriggerKind, INSIGHT_SCHEMA_VERSION,
};
use crate::store::{EventStore, InsightStore, SnapshotStore};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Postgres-backed event, snapshot and insight stores.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventStore for PgStore {
    async fn fetch_events(
        &self,
        scope: &InsightScope,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        cap: usize,
    ) -> anyhow::Result<Vec<BehaviorEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, student_id, course_id, event_type, occurred_at, metadata::text AS metadata
            FROM insight_pipeline.behavior_events
            WHERE student_id = $1
              AND ($2::uuid IS NULL OR course_id = $2::uuid)
              AND occurred_at >= $3
              AND occurred_at <= $4
            ORDER BY occurred_at DESC, id DESC
            LIMIT $5
            "#,
        )
        .bind(scope.student_id)
        .bind(scope.course_id)
        .bind(from)
        .bind(to)
        .bind(cap as i64)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch behavior events")?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows.iter().rev() {
            let raw_metadata: String = row.get("metadata");
            let metadata: BTreeMap<String, Value> =
                serde_json::from_str(&raw_metadata).unwrap_or_default();
            events.push(BehaviorEvent {
                id: row.get("id"),
                student_id: row.get("student_id"),
                course_id: row.get("course_id"),
                event_type: EventType::parse(row.get::<&str, _>("event_type")),
                occurred_at: row.get("occurred_at"),
                metadata,
            });
        }

        debug!(
            student_id = %scope.student_id,
            range = %scope.range,
            fetched = events.len(),
            "Fetched behavior events"
        );
        Ok(events)
    }

    async fn has_events_after(
        &self,
        student_id: Uuid,
        course_id: Option<Uuid>,
        after: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let newer: bool = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM insight_pipeline.behavior_events
                WHERE student_id = $1
                  AND ($2::uuid IS NULL OR course_id = $2::uuid)
                  AND occurred_at > $3
            ) AS newer
            "#,
        )
        .bind(student_id)
        .bind(course_id)
        .bind(after)
        .fetch_one(&self.pool)
        .await?
        .get("newer");
        Ok(newer)
    }
}

fn snapshot_from_row(row: &PgRow) -> anyhow::Result<Snapshot> {
    let raw_summary: String = row.get("summary");
    let summary: StructuredSummary =
        serde_json::from_str(&raw_summary).context("stored summary is not valid JSON")?;
    let range_key: RangeKey = row
        .get::<&str, _>("range_key")
        .parse()
        .map_err(anyhow::Error::msg)?;
    Ok(Snapshot {
        id: row.get("id"),
        student_id: row.get("student_id"),
        course_id: row.get("course_id"),
        range_key,
        schema_version: row.get("schema_version"),
        summary,
        generated_at: row.get("generated_at"),
    })
}

#[async_trait]
impl SnapshotStore for PgStore {
    async fn latest_snapshot(
        &self,
        scope: &InsightScope,
        schema_version: i32,
    ) -> anyhow::Result<Option<Snapshot>> {
        let row = sqlx::query(
            r#"
            SELECT id, student_id, course_id, range_key, schema_version,
                   summary::text AS summary, generated_at
            FROM insight_pipeline.summary_snapshots
            WHERE student_id = $1
              AND course_id IS NOT DISTINCT FROM $2::uuid
              AND range_key = $3
              AND schema_version = $4
            ORDER BY generated_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(scope.student_id)
        .bind(scope.course_id)
        .bind(scope.range.as_str())
        .bind(schema_version)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(snapshot_from_row).transpose()
    }

    async fn insert_snapshot(
        &self,
        summary: &StructuredSummary,
        generated_at: DateTime<Utc>,
    ) -> anyhow::Result<Snapshot> {
        let payload = serde_json::to_string(summary)?;
        let id: i64 = sqlx::query(
            r#"
            INSERT INTO insight_pipeline.summary_snapshots
            (student_id, course_id, range_key, schema_version, summary, generated_at)
            VALUES ($1, $2, $3, $4, $5::jsonb, $6)
            RETURNING id
            "#,
        )
        .bind(summary.student_id)
        .bind(summary.course_id)
        .bind(summary.range_key.as_str())
        .bind(summary.schema_version)
        .bind(payload)
        .bind(generated_at)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert snapshot")?
        .get("id");

        info!(snapshot_id = id, student_id = %summary.student_id, range = %summary.range_key, "Snapshot stored");
        Ok(Snapshot {
            id,
            student_id: summary.student_id,
            course_id: summary.course_id,
            range_key: summary.range_key,
            schema_version: summary.schema_version,
            summary: summary.clone(),
            generated_at,
        })
    }
}

const INSIGHT_COLUMNS: &str = "id, snapshot_id, student_id, course_id, range_key, schema_version, \
     model, prompt_version, status, trigger_kind, model_invoked, payload::text AS payload, \
     error_message, generated_at";

fn insight_from_row(row: &PgRow) -> anyhow::Result<Insight> {
    let raw_payload: String = row.get("payload");
    let body: InsightBody =
        serde_json::from_str(&raw_payload).context("stored insight payload is not valid JSON")?;
    Ok(Insight {
        id: Some(row.get("id")),
        schema_version: row.get("schema_version"),
        snapshot_id: row.get("snapshot_id"),
        student_id: row.get("student_id"),
        course_id: row.get("course_id"),
        range_key: row
            .get::<&str, _>("range_key")
            .parse()
            .map_err(anyhow::Error::msg)?,
        model: row.get("model"),
        prompt_version: row.get("prompt_version"),
        status: InsightStatus::parse(row.get("status"))?,
        trigger: TriggerKind::parse(row.get("trigger_kind"))?,
        model_invoked: row.get("model_invoked"),
        body,
        generated_at: row.get("generated_at"),
        error_message: row.get("error_message"),
    })
}

fn status_labels(statuses: &[InsightStatus]) -> Vec<String> {
    statuses.iter().map(|status| status.as_str().to_string()).collect()
}

#[async_trait]
impl InsightStore for PgStore {
    async fn insert_insight(&self, insight: &Insight) -> anyhow::Result<Insight> {
        let payload = serde_json::to_string(&insight.body)?;
        let id: i64 = sqlx::query(
            r#"
            INSERT INTO insight_pipeline.insights
            (snapshot_id, student_id, course_id, range_key, schema_version, model,
             prompt_version, status, trigger_kind, model_invoked, payload, error_message,
             generated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11::jsonb, $12, $13)
            RETURNING id
            "#,
        )
        .bind(insight.snapshot_id)
        .bind(insight.student_id)
        .bind(insight.course_id)
        .bind(insight.range_key.as_str())
        .bind(insight.schema_version)
        .bind(&insight.model)
        .bind(&insight.prompt_version)
        .bind(insight.status.as_str())
        .bind(insight.trigger.as_str())
        .bind(insight.model_invoked)
        .bind(payload)
        .bind(&insight.error_message)
        .bind(insight.generated_at)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert insight")?
        .get("id");

        let mut stored = insight.clone();
        stored.id = Some(id);
        Ok(stored)
    }

    async fn latest_for_snapshot(
        &self,
        snapshot_id: i64,
        statuses: &[InsightStatus],
    ) -> anyhow::Result<Option<Insight>> {
        let query = format!(
            "SELECT {INSIGHT_COLUMNS} FROM insight_pipeline.insights \
             WHERE snapshot_id = $1 AND schema_version = $2 AND status = ANY($3) \
             ORDER BY generated_at DESC, id DESC LIMIT 1"
        );
        let row = sqlx::query(&query)
            .bind(snapshot_id)
            .bind(INSIGHT_SCHEMA_VERSION)
            .bind(status_labels(statuses))
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(insight_from_row).transpose()
    }

    async fn latest_for_scope(
        &self,
        scope: &InsightScope,
        statuses: &[InsightStatus],
        since: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Option<Insight>> {
        let query = format!(
            "SELECT {INSIGHT_COLUMNS} FROM insight_pipeline.insights \
             WHERE student_id = $1 AND course_id IS NOT DISTINCT FROM $2::uuid \
               AND range_key = $3 AND schema_version = $4 AND status = ANY($5) \
               AND ($6::timestamptz IS NULL OR generated_at >= $6::timestamptz) \
             ORDER BY generated_at DESC, id DESC LIMIT 1"
        );
        let row = sqlx::query(&query)
            .bind(scope.student_id)
            .bind(scope.course_id)
            .bind(scope.range.as_str())
            .bind(INSIGHT_SCHEMA_VERSION)
            .bind(status_labels(statuses))
            .bind(since)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(insight_from_row).transpose()
    }

    async fn count_self_invocations_since(
        &self,
        student_id: Uuid,
        since: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        let used: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) AS used
            FROM insight_pipeline.insights
            WHERE student_id = $1
              AND trigger_kind = 'self'
              AND model_invoked
              AND generated_at >= $2
            "#,
        )
        .bind(student_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?
        .get("used");
        Ok(used.max(0) as u64)
    }
}

async fn insert_event(
    pool: &PgPool,
    student_id: Uuid,
    course_id: Option<Uuid>,
    event_type: EventType,
    occurred_at: DateTime<Utc>,
    metadata: &Value,
    source_key: &str,
) -> anyhow::Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO insight_pipeline.behavior_events
        (student_id, course_id, event_type, occurred_at, metadata, source_key)
        VALUES ($1, $2, $3, $4, $5::jsonb, $6)
        ON CONFLICT (source_key) DO NOTHING
        "#,
    )
    .bind(student_id)
    .bind(course_id)
    .bind(event_type.as_str())
    .bind(occurred_at)
    .bind(metadata.to_string())
    .bind(source_key)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub const SEED_STUDENT: &str = "3d7f5d6f-24f7-4e8e-8b4b-3e7e44b4a7b2";
pub const SEED_COURSE: &str = "0c22f1f1-9184-4fd4-9b21-28c68a6a89dc";

/// Insert a realistic week of activity for one demo student.
pub async fn seed(pool: &PgPool) -> anyhow::Result<usize> {
    let student_id = Uuid::parse_str(SEED_STUDENT)?;
    let course_id = Uuid::parse_str(SEED_COURSE)?;
    let start = Utc::now() - Duration::days(6);

    let plan: Vec<(i64, i64, EventType, Value)> = vec![
        (0, 9 * 60, EventType::ResourceView, serde_json::json!({"category": "video"})),
        (0, 9 * 60 + 20, EventType::AiQuestion, serde_json::json!({})),
        (0, 9 * 60 + 26, EventType::AiFollowUp, serde_json::json!({})),
        (1, 14 * 60, EventType::CommunityAsk, serde_json::json!({"link": "/community/threads/412"})),
        (1, 19 * 60, EventType::AssignmentSubmit, serde_json::json!({"link": "/assignments/7"})),
        (2, 8 * 60, EventType::ResourceView, serde_json::json!({"category": "reading"})),
        (3, 10 * 60, EventType::FeedbackView, serde_json::json!({"link": "/assignments/7/feedback"})),
        (3, 13 * 60 + 45, EventType::AssignmentResubmit, serde_json::json!({"link": "/assignments/7"})),
        (4, 16 * 60, EventType::CommunityAnswer, serde_json::json!({"link": "/community/threads/415"})),
        (5, 11 * 60, EventType::AiQuestion, serde_json::json!({})),
        (5, 11 * 60 + 8, EventType::AiFollowUp, serde_json::json!({})),
        (5, 11 * 60 + 15, EventType::AiFollowUp, serde_json::json!({})),
    ];

    let mut inserted = 0usize;
    for (index, (day, minute, event_type, metadata)) in plan.into_iter().enumerate() {
        let occurred_at = start + Duration::days(day) + Duration::minutes(minute);
        let source_key = format!("seed-{:03}", index + 1);
        if insert_event(
            pool,
            student_id,
            Some(course_id),
            event_type,
            occurred_at,
            &metadata,
            &source_key,
        )
        .await?
        {
            inserted += 1;
        }
    }

    Ok(inserted)
}

pub async fn import_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        student_id: Uuid,
        course_id: Option<Uuid>,
        event_type: String,
        occurred_at: DateTime<Utc>,
        metadata: Option<String>,
        source_key: Option<String>,
    }

    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut inserted = 0usize;

    for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row = result.with_context(|| format!("invalid CSV row {}", line + 1))?;
        let event_type = EventType::parse(&row.event_type);
        if event_type == EventType::Unknown {
            anyhow::bail!("row {}: unknown event type '{}'", line + 1, row.event_type);
        }
        let metadata: Value = match row.metadata.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => serde_json::from_str(raw)
                .with_context(|| format!("row {}: metadata is not valid JSON", line + 1))?,
            _ => serde_json::json!({}),
        };
        let source_key = row
            .source_key
            .unwrap_or_else(|| format!("import-{}", Uuid::new_v4()));

        if insert_event(
            pool,
            row.student_id,
            row.course_id,
            event_type,
            row.occurred_at,
            &metadata,
            &source_key,
        )
        .await?
        {
            inserted += 1;
        }
    }

    Ok(inserted)
}
