//! Stage 1: deterministic compression of a student's raw activity log.
//!
//! Pure computation only: no model calls, no I/O. Stage 2 sees nothing but
//! what comes out of here.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, FixedOffset, Offset, Utc};

use crate::models::{
    ActivityStats, AiStats, AssignmentStats, BehaviorEvent, CommunityStats, EventType,
    EvidenceItem, EvidenceType, FeedbackStats, InsightScope, NonEvaluative, StructuredSummary,
    SUMMARY_SCHEMA_VERSION,
};
use crate::signals::{self, round4};

const MAX_EVENT_REFS: usize = 5;
const FEEDBACK_LOOKBACK_HOURS: i64 = 24;

/// The time range an aggregation is computed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregationWindow {
    pub scope: InsightScope,
    pub period_from: DateTime<Utc>,
    pub period_to: DateTime<Utc>,
}

impl AggregationWindow {
    /// Trailing window ending at `now`.
    pub fn trailing(scope: InsightScope, now: DateTime<Utc>) -> Self {
        Self {
            scope,
            period_from: now - Duration::days(scope.range.days()),
            period_to: now,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Aggregator {
    day_offset: FixedOffset,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(Utc.fix())
    }
}

impl Aggregator {
    pub fn new(day_offset: FixedOffset) -> Self {
        Self { day_offset }
    }

    /// Build a summary from the events of one window.
    ///
    /// Events may arrive in any order; they are put into `(occurred_at, id)`
    /// order before anything else runs, which the feedback matching relies on.
    pub fn aggregate(
        &self,
        window: &AggregationWindow,
        events: &[BehaviorEvent],
    ) -> StructuredSummary {
        let mut sorted = events.to_vec();
        sorted.sort_by_key(BehaviorEvent::order_key);

        let mut counts_by_type: BTreeMap<EventType, u64> = BTreeMap::new();
        for event in &sorted {
            *counts_by_type.entry(event.event_type).or_insert(0) += 1;
        }
        let count = |event_type: EventType| counts_by_type.get(&event_type).copied().unwrap_or(0);

        let iterations = match_feedback_iterations(&sorted);

        let ai = AiStats {
            question_count: count(EventType::AiQuestion),
            follow_up_count: count(EventType::AiFollowUp),
            follow_up_rate: ratio(
                count(EventType::AiFollowUp),
                count(EventType::AiQuestion) + count(EventType::AiFollowUp),
            ),
        };
        let community = CommunityStats {
            ask_count: count(EventType::CommunityAsk),
            answer_count: count(EventType::CommunityAnswer),
            answer_share: ratio(
                count(EventType::CommunityAnswer),
                count(EventType::CommunityAsk) + count(EventType::CommunityAnswer),
            ),
        };
        let assignment = AssignmentStats {
            submit_count: count(EventType::AssignmentSubmit),
            resubmit_count: count(EventType::AssignmentResubmit),
            resubmit_after_feedback_count: iterations.len() as u64,
        };
        let feedback = FeedbackStats {
            view_count: count(EventType::FeedbackView),
        };

        let date_tag = signals::local_day(window.period_to, self.day_offset)
            .format("%Y%m%d")
            .to_string();
        let mut evidence = EvidenceBuilder::new(date_tag);

        if let Some(first) = iterations.first() {
            let gap = first.resubmit.occurred_at - first.feedback.occurred_at;
            evidence.push(
                EvidenceType::FeedbackIteration,
                "Revised work after reading feedback",
                format!(
                    "Resubmitted an assignment {} minutes after viewing feedback; {} resubmission(s) \
                     in this period followed a feedback view within {} hours.",
                    gap.num_minutes(),
                    iterations.len(),
                    FEEDBACK_LOOKBACK_HOURS
                ),
                vec![first.feedback.id, first.resubmit.id],
                first.resubmit.occurred_at,
                first
                    .resubmit
                    .metadata_str("link")
                    .or_else(|| first.feedback.metadata_str("link"))
                    .map(str::to_string),
            );
        }

        if ai.question_count + ai.follow_up_count > 0 {
            evidence.push_recent(
                EvidenceType::AiInquiry,
                "Questions to the AI assistant",
                format!(
                    "Asked the AI assistant {} question(s) and {} follow-up(s); follow-up rate {:.2}.",
                    ai.question_count, ai.follow_up_count, ai.follow_up_rate
                ),
                of_types(&sorted, &[EventType::AiQuestion, EventType::AiFollowUp]),
            );
        }

        if community.ask_count + community.answer_count > 0 {
            evidence.push_recent(
                EvidenceType::CommunityParticipation,
                "Community participation",
                format!(
                    "Posted {} question(s) and {} answer(s) in the course community.",
                    community.ask_count, community.answer_count
                ),
                of_types(&sorted, &[EventType::CommunityAsk, EventType::CommunityAnswer]),
            );
        }

        if assignment.submit_count + assignment.resubmit_count > 0 {
            evidence.push_recent(
                EvidenceType::AssignmentActivity,
                "Assignment submissions",
                format!(
                    "Made {} submission(s) and {} resubmission(s); {} resubmission(s) followed feedback.",
                    assignment.submit_count,
                    assignment.resubmit_count,
                    assignment.resubmit_after_feedback_count
                ),
                of_types(
                    &sorted,
                    &[EventType::AssignmentSubmit, EventType::AssignmentResubmit],
                ),
            );
        }

        if feedback.view_count > 0 {
            evidence.push_recent(
                EvidenceType::FeedbackEngagement,
                "Feedback reviewed",
                format!("Opened teacher feedback {} time(s).", feedback.view_count),
                of_types(&sorted, &[EventType::FeedbackView]),
            );
        }

        let mut by_category: BTreeMap<String, u64> = BTreeMap::new();
        for event in sorted
            .iter()
            .filter(|event| event.event_type == EventType::ResourceView)
        {
            if let Some(category) = event.metadata_str("category") {
                *by_category.entry(category.to_string()).or_insert(0) += 1;
            }
        }

        StructuredSummary {
            schema_version: SUMMARY_SCHEMA_VERSION,
            student_id: window.scope.student_id,
            course_id: window.scope.course_id,
            range_key: window.scope.range,
            period_from: window.period_from,
            period_to: window.period_to,
            input_event_count: events.len(),
            event_types_included: counts_by_type.keys().copied().collect(),
            activity_stats: ActivityStats {
                counts_by_type: counts_by_type.clone(),
                ai,
                community,
                assignment,
                feedback,
            },
            evidence_items: evidence.finish(),
            non_evaluative: NonEvaluative {
                resource_view_count: count(EventType::ResourceView),
                by_category,
            },
            signals: signals::compute(&sorted, self.day_offset),
        }
    }
}

/// A resubmission preceded by a feedback view within the lookback window.
#[derive(Debug)]
struct IterationMatch<'a> {
    feedback: &'a BehaviorEvent,
    resubmit: &'a BehaviorEvent,
}

/// Pair each resubmission with the latest earlier feedback view, if that view
/// is at most 24 hours old. `events` must already be in `order_key` order.
fn match_feedback_iterations(events: &[BehaviorEvent]) -> Vec<IterationMatch<'_>> {
    let feedback = of_types(events, &[EventType::FeedbackView]);
    let resubmits = of_types(events, &[EventType::AssignmentResubmit]);
    let lookback = Duration::hours(FEEDBACK_LOOKBACK_HOURS);

    let mut matches = Vec::new();
    let mut cursor = 0usize;
    for resubmit in resubmits {
        while cursor < feedback.len() && feedback[cursor].order_key() < resubmit.order_key() {
            cursor += 1;
        }
        let Some(candidate) = cursor.checked_sub(1).map(|index| feedback[index]) else {
            continue;
        };
        if resubmit.occurred_at - candidate.occurred_at <= lookback {
            matches.push(IterationMatch {
                feedback: candidate,
                resubmit,
            });
        }
    }
    matches
}

fn of_types<'a>(events: &'a [BehaviorEvent], types: &[EventType]) -> Vec<&'a BehaviorEvent> {
    events
        .iter()
        .filter(|event| types.contains(&event.event_type))
        .collect()
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        round4(part as f64 / whole as f64)
    }
}

/// Hands out `ev_<yyyymmdd>_<seq>` ids in push order.
struct EvidenceBuilder {
    date_tag: String,
    items: Vec<EvidenceItem>,
}

impl EvidenceBuilder {
    fn new(date_tag: String) -> Self {
        Self {
            date_tag,
            items: Vec::new(),
        }
    }

    fn push(
        &mut self,
        evidence_type: EvidenceType,
        title: &str,
        description: String,
        event_refs: Vec<i64>,
        occurred_at: DateTime<Utc>,
        link: Option<String>,
    ) {
        let evidence_id = format!("ev_{}_{}", self.date_tag, self.items.len() + 1);
        self.items.push(EvidenceItem {
            evidence_id,
            evidence_type,
            title: title.to_string(),
            description,
            event_refs,
            occurred_at,
            link,
        });
    }

    /// Cite the most recent contributing events, newest first.
    fn push_recent(
        &mut self,
        evidence_type: EvidenceType,
        title: &str,
        description: String,
        contributing: Vec<&BehaviorEvent>,
    ) {
        let Some(latest) = contributing.last() else {
            return;
        };
        let refs = contributing
            .iter()
            .rev()
            .take(MAX_EVENT_REFS)
            .map(|event| event.id)
            .collect();
        let link = latest.metadata_str("link").map(str::to_string);
        self.push(
            evidence_type,
            title,
            description,
            refs,
            latest.occurred_at,
            link,
        );
    }

    fn finish(self) -> Vec<EvidenceItem> {
        self.items
    }
}
