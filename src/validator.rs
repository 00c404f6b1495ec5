//! Validation of raw model output against the snapshot it was asked about.
//!
//! Parsing happens in two phases. The output is first read as an untyped
//! tree so that forbidden scoring keys and unknown evidence ids can be found
//! anywhere, including in fields the typed shape would drop. Only a tree
//! that passes both scans is projected into [`InsightBody`].

use std::collections::HashSet;

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::error::GroundingViolation;
use crate::models::{
    AbilityDimension, FormativeSuggestion, GroundedStatement, InsightBody, QualitativeLevel,
    StageJudgement, StructuredSummary,
};

/// Fragments that mark a key as carrying a numeric judgement wherever they
/// appear in it, so `totalscore` and `GPAScore` are caught as well as
/// `overall_score`.
const FORBIDDEN_FRAGMENTS: &[&str] = &[
    "score", "weight", "percent", "gpa", "rank", "average", "avg",
];

/// Words that are only forbidden as a whole word of a key, because as
/// fragments they also occur in harmless keys (`meaning`, `iterating`,
/// `checkpoints`, `degraded`).
const FORBIDDEN_WORDS: &[&str] = &[
    "mean", "grade", "grades", "points", "rating", "ratings",
];

/// Top-level schema keys that contain a forbidden fragment but hold a
/// grounded statement object, never a number.
const STRUCTURAL_KEYS: &[&str] = &["explainScore", "explain_score"];

const EVIDENCE_KEYS: &[&str] = &[
    "evidenceRefs",
    "evidence_refs",
    "evidenceIds",
    "evidence_ids",
    "evidenceId",
    "evidence_id",
];

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    /// Output could not be read as the expected structure.
    #[error("malformed model output: {0}")]
    Malformed(String),
    /// Output asserted something the snapshot cannot back.
    #[error(transparent)]
    Grounding(#[from] GroundingViolation),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedInsight {
    pub body: InsightBody,
    /// Dimensions the model left out and that were filled with placeholders.
    pub synthesized: Vec<AbilityDimension>,
}

pub fn validate(raw: &str, summary: &StructuredSummary) -> Result<ValidatedInsight, ValidationError> {
    let tree = parse_tree(raw)?;
    scan_forbidden(&tree, "$")?;

    let allowed: HashSet<&str> = summary.evidence_ids().collect();
    check_evidence_refs(&tree, &allowed, "$")?;

    let payload = project(tree)?;
    let (stage_judgements, synthesized) = complete_dimensions(payload.stage_judgements);

    Ok(ValidatedInsight {
        body: InsightBody {
            explain_score: payload.explain_score,
            stage_judgements,
            formative_suggestions: payload
                .formative_suggestions
                .into_iter()
                .map(RawSuggestion::into_suggestion)
                .collect(),
            risk_alerts: payload.risk_alerts,
            action_recommendations: payload.action_recommendations,
        },
        synthesized,
    })
}

/// Phase one: generic tree. A surrounding markdown fence is tolerated.
fn parse_tree(raw: &str) -> Result<Value, ValidationError> {
    let trimmed = strip_code_fence(raw.trim());
    let tree: Value = serde_json::from_str(trimmed)
        .map_err(|e| ValidationError::Malformed(format!("model output is not JSON: {e}")))?;
    if !tree.is_object() {
        return Err(ValidationError::Malformed(
            "model output must be a JSON object".to_string(),
        ));
    }
    Ok(tree)
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Split a key into lowercase words across camelCase, snake_case and
/// kebab-case boundaries.
fn key_words(key: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut previous_lower = false;

    for ch in key.chars() {
        if !ch.is_alphanumeric() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            previous_lower = false;
            continue;
        }
        if ch.is_uppercase() && previous_lower && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        previous_lower = ch.is_lowercase() || ch.is_ascii_digit();
        current.extend(ch.to_lowercase());
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

fn is_forbidden_key(key: &str) -> bool {
    let lowered = key.to_lowercase();
    if FORBIDDEN_FRAGMENTS
        .iter()
        .any(|fragment| lowered.contains(fragment))
    {
        return true;
    }
    key_words(key)
        .iter()
        .any(|word| FORBIDDEN_WORDS.contains(&word.as_str()))
}

/// `explainScore` is exempt only as a key of the root object holding an
/// object.
fn is_structural(path: &str, key: &str, value: &Value) -> bool {
    path == "$" && STRUCTURAL_KEYS.contains(&key) && value.is_object()
}

fn scan_forbidden(value: &Value, path: &str) -> Result<(), GroundingViolation> {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let child_path = format!("{path}.{key}");
                if is_forbidden_key(key) && !is_structural(path, key, child) {
                    return Err(GroundingViolation::ForbiddenField {
                        path: child_path,
                        key: key.clone(),
                    });
                }
                scan_forbidden(child, &child_path)?;
            }
            Ok(())
        }
        Value::Array(items) => items
            .iter()
            .enumerate()
            .try_for_each(|(index, item)| scan_forbidden(item, &format!("{path}[{index}]"))),
        _ => Ok(()),
    }
}

/// Every evidence reference anywhere in the tree must name an evidence item
/// of the snapshot.
fn check_evidence_refs(
    value: &Value,
    allowed: &HashSet<&str>,
    path: &str,
) -> Result<(), GroundingViolation> {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let child_path = format!("{path}.{key}");
                if EVIDENCE_KEYS.contains(&key.as_str()) {
                    check_reference_values(child, allowed, &child_path)?;
                } else {
                    check_evidence_refs(child, allowed, &child_path)?;
                }
            }
            Ok(())
        }
        Value::Array(items) => items.iter().enumerate().try_for_each(|(index, item)| {
            check_evidence_refs(item, allowed, &format!("{path}[{index}]"))
        }),
        _ => Ok(()),
    }
}

fn check_reference_values(
    value: &Value,
    allowed: &HashSet<&str>,
    path: &str,
) -> Result<(), GroundingViolation> {
    match value {
        Value::Null => Ok(()),
        Value::String(id) if allowed.contains(id.as_str()) => Ok(()),
        Value::Array(items) => items.iter().enumerate().try_for_each(|(index, item)| {
            check_reference_values(item, allowed, &format!("{path}[{index}]"))
        }),
        other => Err(GroundingViolation::UnknownEvidence {
            path: path.to_string(),
            evidence_id: match other {
                Value::String(id) => id.clone(),
                _ => other.to_string(),
            },
        }),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPayload {
    #[serde(default, alias = "explain_score")]
    explain_score: GroundedStatement,
    #[serde(default, alias = "stage_judgements")]
    stage_judgements: Vec<RawJudgement>,
    #[serde(default, alias = "formative_suggestions")]
    formative_suggestions: Vec<RawSuggestion>,
    #[serde(default, alias = "risk_alerts")]
    risk_alerts: Vec<GroundedStatement>,
    #[serde(default, alias = "action_recommendations")]
    action_recommendations: Vec<GroundedStatement>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawJudgement {
    #[serde(alias = "code")]
    dimension: String,
    level: QualitativeLevel,
    #[serde(default)]
    rationale: String,
    #[serde(default, alias = "evidence_refs")]
    evidence_refs: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSuggestion {
    #[serde(default)]
    text: String,
    #[serde(default)]
    dimension: Option<String>,
    #[serde(default, alias = "evidence_refs")]
    evidence_refs: Vec<String>,
}

impl RawSuggestion {
    fn into_suggestion(self) -> FormativeSuggestion {
        FormativeSuggestion {
            text: self.text,
            dimension: self.dimension.as_deref().and_then(AbilityDimension::from_code),
            evidence_refs: self.evidence_refs,
        }
    }
}

/// Phase two: typed projection, only after both scans passed.
fn project(tree: Value) -> Result<RawPayload, ValidationError> {
    serde_json::from_value(tree)
        .map_err(|e| ValidationError::Malformed(format!("model output has an unexpected shape: {e}")))
}

/// One judgement per dimension, in canonical order. The first judgement for a
/// dimension wins; unknown codes are dropped; gaps get a placeholder.
fn complete_dimensions(raw: Vec<RawJudgement>) -> (Vec<StageJudgement>, Vec<AbilityDimension>) {
    let mut by_dimension: Vec<Option<StageJudgement>> = vec![None; AbilityDimension::ALL.len()];

    for judgement in raw {
        let Some(dimension) = AbilityDimension::from_code(&judgement.dimension) else {
            warn!(code = %judgement.dimension, "Dropping judgement for unknown dimension");
            continue;
        };
        let Some(slot) = AbilityDimension::ALL
            .iter()
            .position(|candidate| *candidate == dimension)
        else {
            continue;
        };
        if by_dimension[slot].is_none() {
            by_dimension[slot] = Some(StageJudgement {
                dimension,
                level: judgement.level,
                rationale: judgement.rationale,
                evidence_refs: judgement.evidence_refs,
            });
        }
    }

    let mut synthesized = Vec::new();
    let judgements: Vec<StageJudgement> = AbilityDimension::ALL
        .into_iter()
        .zip(by_dimension)
        .map(|(dimension, judgement)| {
            judgement.unwrap_or_else(|| {
                synthesized.push(dimension);
                StageJudgement::insufficient(dimension)
            })
        })
        .collect();
    (judgements, synthesized)
}
