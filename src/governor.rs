//! Quota, cooldown and reuse policy for insight requests.
//!
//! The daily count is read at request time with no locking, so a burst of
//! simultaneous self-triggered requests can overshoot the limit slightly.
//! That is accepted: this is an anti-abuse control, not billing.

use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, NaiveTime, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{Insight, InsightStatus, Snapshot, TriggerKind};
use crate::store::InsightStore;

/// Statuses that represent an actual interpretation worth showing again.
pub const INTERPRETED: &[InsightStatus] = &[InsightStatus::Success, InsightStatus::Partial];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuotaPolicy {
    pub limit_per_day: u32,
    pub reuse_window_days: i64,
    pub day_offset: FixedOffset,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            limit_per_day: 7,
            reuse_window_days: 7,
            day_offset: Utc.fix(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// A student asking about themselves.
    SelfTrigger,
    /// A teacher or administrator auditing a student.
    Operator { force: bool },
}

impl TriggerMode {
    pub fn kind(&self) -> TriggerKind {
        match self {
            TriggerMode::SelfTrigger => TriggerKind::SelfTrigger,
            TriggerMode::Operator { .. } => TriggerKind::Operator,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaInfo {
    pub used_today: u64,
    pub limit_per_day: u32,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

impl QuotaInfo {
    fn new(used_today: u64, limit_per_day: u32, reset_at: DateTime<Utc>) -> Self {
        Self {
            used_today,
            limit_per_day,
            remaining: u64::from(limit_per_day).saturating_sub(used_today),
            reset_at,
        }
    }

    pub fn exhausted(&self) -> bool {
        self.used_today >= u64::from(self.limit_per_day)
    }

    /// Quota as it stands after one more genuine invocation.
    pub fn consumed(&self) -> Self {
        Self::new(self.used_today + 1, self.limit_per_day, self.reset_at)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CooldownInfo {
    pub active: bool,
    pub reason: String,
    pub reset_at: DateTime<Utc>,
    pub retry_after_secs: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Hand back an existing insight; no model call.
    Reuse(Insight),
    /// Daily limit reached; show the best stored result, if any.
    Cooldown {
        fallback: Option<Insight>,
        cooldown: CooldownInfo,
    },
    /// Go ahead and call the model.
    Invoke,
}

pub struct Governor {
    insights: Arc<dyn InsightStore>,
    policy: QuotaPolicy,
}

impl Governor {
    pub fn new(insights: Arc<dyn InsightStore>, policy: QuotaPolicy) -> Self {
        Self { insights, policy }
    }

    /// Start of the current calendar day and the next midnight, both in UTC.
    pub fn day_bounds(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let offset = self.policy.day_offset;
        let local_midnight = now
            .with_timezone(&offset)
            .date_naive()
            .and_time(NaiveTime::MIN);
        let start = Utc.from_utc_datetime(
            &(local_midnight - Duration::seconds(i64::from(offset.local_minus_utc()))),
        );
        (start, start + Duration::days(1))
    }

    pub async fn quota(&self, student_id: Uuid, now: DateTime<Utc>) -> anyhow::Result<QuotaInfo> {
        let (start, reset_at) = self.day_bounds(now);
        let used = self
            .insights
            .count_self_invocations_since(student_id, start)
            .await?;
        Ok(QuotaInfo::new(used, self.policy.limit_per_day, reset_at))
    }

    /// Decide how to serve a request for an insight on `snapshot`. The caller
    /// has already ruled out the no-evidence case.
    pub async fn decide(
        &self,
        snapshot: &Snapshot,
        mode: TriggerMode,
        quota: Option<&QuotaInfo>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Decision> {
        let scope = snapshot.scope();
        match mode {
            TriggerMode::Operator { force: true } => Ok(Decision::Invoke),
            TriggerMode::Operator { force: false } => {
                let since = now - Duration::days(self.policy.reuse_window_days);
                let recent = self
                    .insights
                    .latest_for_scope(&scope, &[InsightStatus::Success], Some(since))
                    .await?;
                Ok(match recent {
                    Some(insight) => {
                        debug!(insight_id = ?insight.id, "Operator request reuses recent insight");
                        Decision::Reuse(insight)
                    }
                    None => Decision::Invoke,
                })
            }
            TriggerMode::SelfTrigger => {
                if let Some(existing) = self
                    .insights
                    .latest_for_snapshot(snapshot.id, INTERPRETED)
                    .await?
                {
                    return Ok(Decision::Reuse(existing));
                }

                let Some(quota) = quota.filter(|quota| quota.exhausted()) else {
                    return Ok(Decision::Invoke);
                };

                info!(
                    student_id = %snapshot.student_id,
                    used_today = quota.used_today,
                    limit = quota.limit_per_day,
                    "Daily insight limit reached"
                );
                let fallback = self
                    .insights
                    .latest_for_scope(&scope, INTERPRETED, None)
                    .await?;
                Ok(Decision::Cooldown {
                    fallback,
                    cooldown: CooldownInfo {
                        active: true,
                        reason: format!(
                            "daily limit of {} insight generations reached",
                            quota.limit_per_day
                        ),
                        reset_at: quota.reset_at,
                        retry_after_secs: (quota.reset_at - now).num_seconds().max(0),
                    },
                })
            }
        }
    }
}
