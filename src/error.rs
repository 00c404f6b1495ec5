use std::fmt;

/// Errors surfaced by the insight pipeline's external operations.
///
/// Stage 1 never produces one of these; it degrades to zero-valued output.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("model output rejected: {0}")]
    Grounding(#[from] GroundingViolation),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Model output asserted something Stage 1 cannot back.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GroundingViolation {
    #[error("forbidden scoring field '{key}' at {path}")]
    ForbiddenField { path: String, key: String },

    #[error("unknown evidence id '{evidence_id}' at {path}")]
    UnknownEvidence { path: String, evidence_id: String },
}

/// Classified upstream failure of the text-generation endpoint.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} ({}): {message}", status_label(.status))]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub status: Option<u16>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// 401/403
    Auth,
    /// 429
    RateLimit,
    Timeout,
    /// Connection refused, DNS failure, reset.
    Network,
    /// 5xx
    ServerError,
    /// Response arrived but is not usable output.
    Malformed,
    Unknown,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProviderErrorKind::Auth => "authentication failed",
            ProviderErrorKind::RateLimit => "rate limited",
            ProviderErrorKind::Timeout => "timed out",
            ProviderErrorKind::Network => "network error",
            ProviderErrorKind::ServerError => "server error",
            ProviderErrorKind::Malformed => "malformed output",
            ProviderErrorKind::Unknown => "unexpected response",
        };
        formatter.write_str(label)
    }
}

fn status_label(status: &Option<u16>) -> String {
    status
        .map(|code| format!("HTTP {code}"))
        .unwrap_or_else(|| "no status".to_string())
}

const MAX_MESSAGE_LEN: usize = 500;

impl ProviderError {
    pub fn from_status(status: u16, body: &str) -> Self {
        let kind = match status {
            401 | 403 => ProviderErrorKind::Auth,
            408 => ProviderErrorKind::Timeout,
            429 => ProviderErrorKind::RateLimit,
            500..=599 => ProviderErrorKind::ServerError,
            _ => ProviderErrorKind::Unknown,
        };
        Self {
            kind,
            status: Some(status),
            message: truncate(body),
        }
    }

    pub fn network(err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ProviderErrorKind::Timeout
        } else {
            ProviderErrorKind::Network
        };
        Self {
            kind,
            status: None,
            message: truncate(&err.to_string()),
        }
    }

    pub fn malformed(message: impl AsRef<str>) -> Self {
        Self {
            kind: ProviderErrorKind::Malformed,
            status: None,
            message: truncate(message.as_ref()),
        }
    }
}

fn truncate(text: &str) -> String {
    if text.len() <= MAX_MESSAGE_LEN {
        return text.to_string();
    }
    let mut end = MAX_MESSAGE_LEN;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_are_classified() {
        assert_eq!(ProviderError::from_status(401, "").kind, ProviderErrorKind::Auth);
        assert_eq!(
            ProviderError::from_status(429, "slow down").kind,
            ProviderErrorKind::RateLimit
        );
        assert_eq!(
            ProviderError::from_status(503, "").kind,
            ProviderErrorKind::ServerError
        );
        assert_eq!(ProviderError::from_status(418, "").kind, ProviderErrorKind::Unknown);
    }

    #[test]
    fn long_bodies_are_truncated_on_char_boundaries() {
        let body = "é".repeat(400);
        let error = ProviderError::from_status(500, &body);
        assert!(error.message.len() <= MAX_MESSAGE_LEN + 3);
        assert!(error.message.ends_with("..."));
    }

    #[test]
    fn display_includes_kind_and_status() {
        let error = ProviderError::from_status(503, "upstream down");
        assert_eq!(error.to_string(), "server error (HTTP 503): upstream down");
        assert_eq!(
            ProviderError::malformed("not json").to_string(),
            "malformed output (no status): not json"
        );
    }
}
