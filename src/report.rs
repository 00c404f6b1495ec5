use std::fmt::Write;

use crate::models::{BurstSignal, EventType, Snapshot, StructuredSummary};
use crate::service::InsightResponse;

/// Event types ordered by how often they occurred, most frequent first.
pub fn activity_mix(summary: &StructuredSummary) -> Vec<(EventType, u64)> {
    let mut mix: Vec<(EventType, u64)> = summary
        .activity_stats
        .counts_by_type
        .iter()
        .filter(|(_, count)| **count > 0)
        .map(|(event_type, count)| (*event_type, *count))
        .collect();
    mix.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    mix
}

fn burst_line(label: &str, signal: &BurstSignal) -> String {
    format!(
        "- {} burst: {} (max {} in {} min, threshold {})",
        label,
        if signal.burst { "yes" } else { "no" },
        signal.max_in_window,
        signal.window_minutes,
        signal.threshold
    )
}

pub fn build_report(snapshot: &Snapshot, latest: Option<&InsightResponse>) -> String {
    let summary = &snapshot.summary;
    let mut output = String::new();

    let course_label = summary
        .course_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "all courses".to_string());

    let _ = writeln!(output, "# Learning Activity Report");
    let _ = writeln!(
        output,
        "Student {} in {}, range {} ({} to {})",
        summary.student_id,
        course_label,
        summary.range_key,
        summary.period_from.format("%Y-%m-%d"),
        summary.period_to.format("%Y-%m-%d")
    );
    let _ = writeln!(
        output,
        "Summary #{} generated {} from {} events",
        snapshot.id,
        snapshot.generated_at.format("%Y-%m-%d %H:%M UTC"),
        summary.input_event_count
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Activity Mix");

    let mix = activity_mix(summary);
    if mix.is_empty() {
        let _ = writeln!(output, "No activity recorded for this window.");
    } else {
        for (event_type, count) in &mix {
            let _ = writeln!(output, "- {}: {}", event_type.as_str(), count);
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Evidence");

    if summary.evidence_items.is_empty() {
        let _ = writeln!(output, "No evidence items for this window.");
    } else {
        for item in &summary.evidence_items {
            let _ = writeln!(
                output,
                "- [{}] {}: {}",
                item.evidence_id, item.title, item.description
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Interpretation");

    match latest {
        None => {
            let _ = writeln!(output, "No insight has been generated yet.");
        }
        Some(response) => {
            let insight = &response.insight;
            let _ = writeln!(
                output,
                "Status {} ({}, {}), generated {}",
                insight.status.as_str(),
                insight.model,
                insight.prompt_version,
                insight.generated_at.format("%Y-%m-%d %H:%M UTC")
            );
            if let Some(notice) = &response.extra.notice {
                let _ = writeln!(output, "> {notice}");
            }
            let _ = writeln!(output);
            let _ = writeln!(output, "{}", insight.body.explain_score.text);
            let _ = writeln!(output);
            let _ = writeln!(output, "### Stage Judgements");
            for judgement in &insight.body.stage_judgements {
                let _ = writeln!(
                    output,
                    "- {}: {} ({}) {}",
                    judgement.dimension.code(),
                    judgement.level.as_str(),
                    judgement.rationale,
                    judgement.evidence_refs.join(", ")
                );
            }

            if !insight.body.formative_suggestions.is_empty() {
                let _ = writeln!(output);
                let _ = writeln!(output, "### Suggestions");
                for suggestion in &insight.body.formative_suggestions {
                    let _ = writeln!(output, "- {}", suggestion.text);
                }
            }
        }
    }

    let signals = &summary.signals;
    let _ = writeln!(output);
    let _ = writeln!(output, "## Advisory Signals");
    let _ = writeln!(output, "- active days: {}", signals.active_days);
    let _ = writeln!(
        output,
        "- busiest day share: {:.2}",
        signals.max_daily_share.all
    );
    let _ = writeln!(output, "{}", burst_line("all activity", &signals.bursts.all));
    let _ = writeln!(output, "{}", burst_line("AI", &signals.bursts.ai));
    let _ = writeln!(output, "{}", burst_line("submission", &signals.bursts.submission));

    output
}
