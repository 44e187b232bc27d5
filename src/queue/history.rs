//! Per-page attempt history.
//!
//! Every finished fetch attempt appends one row to `page_attempts`, so the
//! full retry story of a page survives restarts and can be inspected later.

use std::fmt;
use std::str::FromStr;

use sqlx::FromRow;

use crate::failure::ErrorKind;

/// How a single fetch attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Page stored and verified.
    Validated,
    /// Failed; another attempt was scheduled.
    Retried,
    /// Failed with no further attempts.
    Failed,
    /// Aborted by cancellation.
    Cancelled,
}

impl AttemptOutcome {
    /// Returns the storage representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validated => "validated",
            Self::Retried => "retried",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AttemptOutcome {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "validated" => Ok(Self::Validated),
            "retried" => Ok(Self::Retried),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("invalid attempt outcome: {value}")),
        }
    }
}

/// Insert payload for one finished attempt.
#[derive(Debug, Clone)]
pub struct NewPageAttempt<'a> {
    pub item_id: i64,
    pub page_index: usize,
    /// 1-based attempt number.
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    pub error_kind: Option<ErrorKind>,
    pub http_status: Option<u16>,
    pub byte_size: Option<u64>,
    pub duration_ms: u64,
    pub message: Option<&'a str>,
}

/// Read model for persisted attempt rows.
#[derive(Debug, Clone, FromRow)]
pub struct PageAttempt {
    /// Row id.
    pub id: i64,
    pub item_id: i64,
    pub page_index: i64,
    pub attempt: i64,
    /// Stored outcome text.
    #[sqlx(rename = "outcome")]
    pub outcome_str: String,
    /// Stored error kind text.
    #[sqlx(rename = "error_kind")]
    pub error_kind_str: Option<String>,
    pub http_status: Option<i64>,
    pub byte_size: Option<i64>,
    pub duration_ms: i64,
    pub message: Option<String>,
    /// Unix millis.
    pub created_at: i64,
}

impl PageAttempt {
    /// Parses `outcome_str`; unknown values map to `failed`.
    #[must_use]
    pub fn outcome(&self) -> AttemptOutcome {
        self.outcome_str.parse().unwrap_or(AttemptOutcome::Failed)
    }

    /// Parses `error_kind_str`; unknown values are dropped.
    #[must_use]
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error_kind_str
            .as_deref()
            .and_then(|value| value.parse().ok())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_outcome_roundtrip() {
        for outcome in [
            AttemptOutcome::Validated,
            AttemptOutcome::Retried,
            AttemptOutcome::Failed,
            AttemptOutcome::Cancelled,
        ] {
            assert_eq!(outcome.as_str().parse::<AttemptOutcome>().unwrap(), outcome);
        }
        assert!("skipped".parse::<AttemptOutcome>().is_err());
    }

    #[test]
    fn test_page_attempt_typed_accessors() {
        let row = PageAttempt {
            id: 1,
            item_id: 3,
            page_index: 0,
            attempt: 2,
            outcome_str: "retried".to_string(),
            error_kind_str: Some("server".to_string()),
            http_status: Some(503),
            byte_size: None,
            duration_ms: 12,
            message: Some("HTTP 503".to_string()),
            created_at: 0,
        };
        assert_eq!(row.outcome(), AttemptOutcome::Retried);
        assert_eq!(row.error_kind(), Some(ErrorKind::Server));

        let unknown = PageAttempt {
            outcome_str: "bogus".to_string(),
            error_kind_str: Some("bogus".to_string()),
            ..row
        };
        assert_eq!(unknown.outcome(), AttemptOutcome::Failed);
        assert_eq!(unknown.error_kind(), None);
    }
}
