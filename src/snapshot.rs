use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::aggregator::{AggregationWindow, Aggregator};
use crate::models::{InsightScope, Snapshot, SUMMARY_SCHEMA_VERSION};
use crate::store::{EventStore, SnapshotStore};

/// Default cap on events fed into one aggregation.
pub const DEFAULT_EVENT_CAP: usize = 5_000;

/// Result of [`SnapshotManager::get_or_build_summary`].
#[derive(Debug, Clone)]
pub struct CurrentSnapshot {
    pub snapshot: Snapshot,
    /// A new snapshot was written by this call.
    pub rebuilt: bool,
}

/// Keeps Stage 1 snapshots current relative to the event log.
pub struct SnapshotManager {
    events: Arc<dyn EventStore>,
    snapshots: Arc<dyn SnapshotStore>,
    aggregator: Aggregator,
    event_cap: usize,
}

impl SnapshotManager {
    pub fn new(
        events: Arc<dyn EventStore>,
        snapshots: Arc<dyn SnapshotStore>,
        aggregator: Aggregator,
        event_cap: usize,
    ) -> Self {
        Self {
            events,
            snapshots,
            aggregator,
            event_cap,
        }
    }

    pub async fn latest(&self, scope: &InsightScope) -> anyhow::Result<Option<Snapshot>> {
        self.snapshots
            .latest_snapshot(scope, SUMMARY_SCHEMA_VERSION)
            .await
    }

    /// A snapshot is stale once any event of its (student, course) occurred
    /// after it was generated. Wall-clock age plays no part.
    pub async fn is_stale(&self, snapshot: &Snapshot) -> anyhow::Result<bool> {
        self.events
            .has_events_after(snapshot.student_id, snapshot.course_id, snapshot.generated_at)
            .await
    }

    /// Return the latest snapshot if it is still current, otherwise recompute
    /// and persist a new one.
    pub async fn get_or_build_summary(
        &self,
        scope: &InsightScope,
        now: DateTime<Utc>,
    ) -> anyhow::Result<CurrentSnapshot> {
        if let Some(snapshot) = self.latest(scope).await? {
            if !self.is_stale(&snapshot).await? {
                debug!(snapshot_id = snapshot.id, "Reusing current snapshot");
                return Ok(CurrentSnapshot {
                    snapshot,
                    rebuilt: false,
                });
            }
            info!(snapshot_id = snapshot.id, "Snapshot is stale, recomputing");
        }
        Ok(CurrentSnapshot {
            snapshot: self.build_and_save_snapshot(scope, now).await?,
            rebuilt: true,
        })
    }

    /// Recompute unconditionally, for explicit refreshes.
    pub async fn build_and_save_snapshot(
        &self,
        scope: &InsightScope,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Snapshot> {
        let window = AggregationWindow::trailing(*scope, now);
        let events = self
            .events
            .fetch_events(scope, window.period_from, window.period_to, self.event_cap)
            .await?;
        let summary = self.aggregator.aggregate(&window, &events);
        info!(
            student_id = %scope.student_id,
            range = %scope.range,
            events = summary.input_event_count,
            evidence = summary.evidence_items.len(),
            "Summary computed"
        );
        self.snapshots.insert_snapshot(&summary, now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventType, RangeKey};
    use crate::testing::MemoryStore;
    use chrono::{Duration, TimeZone};
    use uuid::Uuid;

    fn manager(store: &Arc<MemoryStore>, cap: usize) -> SnapshotManager {
        SnapshotManager::new(store.clone(), store.clone(), Aggregator::default(), cap)
    }

    fn scope(student_id: Uuid) -> InsightScope {
        InsightScope {
            student_id,
            course_id: None,
            range: RangeKey::Days7,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 8, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn current_snapshot_is_reused() {
        let store = Arc::new(MemoryStore::default());
        let student = Uuid::new_v4();
        store.add_event(student, None, EventType::AiQuestion, now() - Duration::days(1));

        let manager = manager(&store, DEFAULT_EVENT_CAP);
        let first = manager.get_or_build_summary(&scope(student), now()).await.unwrap();
        let second = manager
            .get_or_build_summary(&scope(student), now() + Duration::hours(1))
            .await
            .unwrap();

        assert!(first.rebuilt);
        assert!(!second.rebuilt);
        assert_eq!(first.snapshot.id, second.snapshot.id);
        assert_eq!(store.snapshots().len(), 1);
    }

    #[tokio::test]
    async fn newer_event_makes_snapshot_stale() {
        let store = Arc::new(MemoryStore::default());
        let student = Uuid::new_v4();
        store.add_event(student, None, EventType::AiQuestion, now() - Duration::days(1));

        let manager = manager(&store, DEFAULT_EVENT_CAP);
        let first = manager.get_or_build_summary(&scope(student), now()).await.unwrap().snapshot;
        store.add_event(student, None, EventType::AiFollowUp, now() + Duration::minutes(5));
        assert!(manager.is_stale(&first).await.unwrap());

        let later = now() + Duration::minutes(10);
        let second = manager.get_or_build_summary(&scope(student), later).await.unwrap();
        assert!(second.rebuilt);
        let second = second.snapshot;
        assert_ne!(first.id, second.id);
        assert_eq!(second.summary.input_event_count, 2);
        assert_eq!(store.snapshots().len(), 2);
    }

    #[tokio::test]
    async fn other_students_do_not_stale_a_snapshot() {
        let store = Arc::new(MemoryStore::default());
        let student = Uuid::new_v4();
        let manager = manager(&store, DEFAULT_EVENT_CAP);
        let snapshot = manager.get_or_build_summary(&scope(student), now()).await.unwrap().snapshot;

        store.add_event(Uuid::new_v4(), None, EventType::AiQuestion, now() + Duration::hours(1));
        assert!(!manager.is_stale(&snapshot).await.unwrap());
    }

    #[tokio::test]
    async fn forced_rebuild_always_writes_and_is_idempotent() {
        let store = Arc::new(MemoryStore::default());
        let student = Uuid::new_v4();
        store.add_event(student, None, EventType::CommunityAsk, now() - Duration::days(2));
        store.add_event(student, None, EventType::FeedbackView, now() - Duration::days(1));

        let manager = manager(&store, DEFAULT_EVENT_CAP);
        let first = manager.build_and_save_snapshot(&scope(student), now()).await.unwrap();
        let second = manager.build_and_save_snapshot(&scope(student), now()).await.unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(first.summary, second.summary);
        assert_eq!(store.snapshots().len(), 2);
    }

    #[tokio::test]
    async fn event_cap_keeps_most_recent_events() {
        let store = Arc::new(MemoryStore::default());
        let student = Uuid::new_v4();
        for minute in 0..10 {
            store.add_event(
                student,
                None,
                EventType::ResourceView,
                now() - Duration::hours(3) + Duration::minutes(minute),
            );
        }
        let snapshot = manager(&store, 4)
            .build_and_save_snapshot(&scope(student), now())
            .await
            .unwrap();
        assert_eq!(snapshot.summary.input_event_count, 4);
    }

    #[tokio::test]
    async fn events_outside_the_range_are_ignored() {
        let store = Arc::new(MemoryStore::default());
        let student = Uuid::new_v4();
        store.add_event(student, None, EventType::AiQuestion, now() - Duration::days(20));
        store.add_event(student, None, EventType::AiQuestion, now() - Duration::days(2));

        let snapshot = manager(&store, DEFAULT_EVENT_CAP)
            .get_or_build_summary(&scope(student), now())
            .await
            .unwrap()
            .snapshot;
        assert_eq!(snapshot.summary.input_event_count, 1);
    }
}
