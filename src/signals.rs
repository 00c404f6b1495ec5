//! Time-distribution and anti-gaming signals.
//!
//! Everything here is advisory. None of these values may be cited as ability
//! evidence; they only tell a reader how the activity was spread over time.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};

use crate::models::{
    BehaviorEvent, BurstSignal, BurstSignals, DailyShareSignals, EventType, TimeSignals, AI_TYPES,
    COMMUNITY_TYPES, SUBMISSION_TYPES,
};

/// Sliding-window burst detector over a set of event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurstDetector {
    pub window_minutes: i64,
    pub threshold: usize,
}

pub const ALL_TYPES_BURST: BurstDetector = BurstDetector {
    window_minutes: 5,
    threshold: 8,
};

pub const AI_BURST: BurstDetector = BurstDetector {
    window_minutes: 5,
    threshold: 6,
};

pub const SUBMISSION_BURST: BurstDetector = BurstDetector {
    window_minutes: 10,
    threshold: 3,
};

/// Per-day cap applied before counts are treated as effective activity.
/// Resource views are non-evaluative and never capped.
pub const DAILY_CAPS: &[(EventType, u64)] = &[
    (EventType::AiQuestion, 10),
    (EventType::AiFollowUp, 10),
    (EventType::CommunityAsk, 5),
    (EventType::CommunityAnswer, 10),
    (EventType::AssignmentSubmit, 5),
    (EventType::AssignmentResubmit, 5),
    (EventType::FeedbackView, 10),
];

pub fn daily_cap(event_type: EventType) -> Option<u64> {
    DAILY_CAPS
        .iter()
        .find(|(capped, _)| *capped == event_type)
        .map(|(_, cap)| *cap)
}

pub fn local_day(at: DateTime<Utc>, offset: FixedOffset) -> NaiveDate {
    at.with_timezone(&offset).date_naive()
}

fn matches(event: &BehaviorEvent, types: Option<&[EventType]>) -> bool {
    types.map_or(true, |set| set.contains(&event.event_type))
}

pub fn active_days(events: &[BehaviorEvent], offset: FixedOffset) -> u32 {
    let days: BTreeSet<NaiveDate> = events
        .iter()
        .map(|event| local_day(event.occurred_at, offset))
        .collect();
    days.len() as u32
}

/// Largest fraction of the selected events that fell on a single day.
pub fn max_daily_share(
    events: &[BehaviorEvent],
    types: Option<&[EventType]>,
    offset: FixedOffset,
) -> f64 {
    let mut per_day: HashMap<NaiveDate, u64> = HashMap::new();
    let mut total = 0u64;

    for event in events.iter().filter(|event| matches(event, types)) {
        *per_day
            .entry(local_day(event.occurred_at, offset))
            .or_insert(0) += 1;
        total += 1;
    }

    if total == 0 {
        return 0.0;
    }
    let max = per_day.values().copied().max().unwrap_or(0);
    round4(max as f64 / total as f64)
}

impl BurstDetector {
    /// Two-pointer sweep over sorted timestamps. A window covers
    /// `[start, start + window_minutes)`.
    pub fn detect(&self, events: &[BehaviorEvent], types: Option<&[EventType]>) -> BurstSignal {
        let mut times: Vec<DateTime<Utc>> = events
            .iter()
            .filter(|event| matches(event, types))
            .map(|event| event.occurred_at)
            .collect();
        times.sort();

        let width = Duration::minutes(self.window_minutes);
        let mut max_in_window = 0usize;
        let mut window_start = None;
        let mut left = 0usize;

        for right in 0..times.len() {
            while times[right] - times[left] >= width {
                left += 1;
            }
            let in_window = right - left + 1;
            if in_window > max_in_window {
                max_in_window = in_window;
                window_start = Some(times[left]);
            }
        }

        BurstSignal {
            window_minutes: self.window_minutes,
            threshold: self.threshold,
            max_in_window,
            burst: self.threshold > 0 && max_in_window >= self.threshold,
            window_start,
        }
    }
}

/// Per-type totals after applying the daily cap table day by day.
pub fn effective_counts(events: &[BehaviorEvent], offset: FixedOffset) -> BTreeMap<EventType, u64> {
    let mut per_day: HashMap<(EventType, NaiveDate), u64> = HashMap::new();
    for event in events {
        if daily_cap(event.event_type).is_none() {
            continue;
        }
        *per_day
            .entry((event.event_type, local_day(event.occurred_at, offset)))
            .or_insert(0) += 1;
    }

    let mut totals = BTreeMap::new();
    for ((event_type, _day), count) in per_day {
        let cap = daily_cap(event_type).unwrap_or(count);
        *totals.entry(event_type).or_insert(0) += count.min(cap);
    }
    totals
}

pub fn compute(events: &[BehaviorEvent], offset: FixedOffset) -> TimeSignals {
    TimeSignals {
        active_days: active_days(events, offset),
        max_daily_share: DailyShareSignals {
            all: max_daily_share(events, None, offset),
            ai: max_daily_share(events, Some(AI_TYPES), offset),
            community: max_daily_share(events, Some(COMMUNITY_TYPES), offset),
            submission: max_daily_share(events, Some(SUBMISSION_TYPES), offset),
        },
        bursts: BurstSignals {
            all: ALL_TYPES_BURST.detect(events, None),
            ai: AI_BURST.detect(events, Some(AI_TYPES)),
            submission: SUBMISSION_BURST.detect(events, Some(SUBMISSION_TYPES)),
        },
        effective_counts_by_type: effective_counts(events, offset),
        daily_caps: DAILY_CAPS.iter().copied().collect(),
    }
}

pub(crate) fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}
