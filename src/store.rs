//! Persistence seams. Every write is an append; "current" always means
//! "latest by generation time".

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{BehaviorEvent, Insight, InsightScope, InsightStatus, Snapshot, StructuredSummary};

/// Read side of the append-only behavioral event log.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Events for the scope with `from <= occurred_at <= to`, keeping the `cap`
    /// most recent, returned in `(occurred_at, id)` order. A scope without a
    /// course covers every course of the student.
    async fn fetch_events(
        &self,
        scope: &InsightScope,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        cap: usize,
    ) -> anyhow::Result<Vec<BehaviorEvent>>;

    async fn has_events_after(
        &self,
        student_id: Uuid,
        course_id: Option<Uuid>,
        after: DateTime<Utc>,
    ) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn latest_snapshot(
        &self,
        scope: &InsightScope,
        schema_version: i32,
    ) -> anyhow::Result<Option<Snapshot>>;

    async fn insert_snapshot(
        &self,
        summary: &StructuredSummary,
        generated_at: DateTime<Utc>,
    ) -> anyhow::Result<Snapshot>;
}

#[async_trait]
pub trait InsightStore: Send + Sync {
    /// Persist and return the record with its assigned id.
    async fn insert_insight(&self, insight: &Insight) -> anyhow::Result<Insight>;

    async fn latest_for_snapshot(
        &self,
        snapshot_id: i64,
        statuses: &[InsightStatus],
    ) -> anyhow::Result<Option<Insight>>;

    /// Latest insight for the scope regardless of which snapshot it was
    /// validated against, optionally no older than `since`.
    async fn latest_for_scope(
        &self,
        scope: &InsightScope,
        statuses: &[InsightStatus],
        since: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Option<Insight>>;

    /// Self-triggered insights for the student, generated at or after `since`,
    /// that actually invoked the model.
    async fn count_self_invocations_since(
        &self,
        student_id: Uuid,
        since: DateTime<Utc>,
    ) -> anyhow::Result<u64>;
}
