//! Error types for queue operations.

use std::fmt;

use thiserror::Error;

use super::ItemState;

/// What kind of database failure a [`QueueError::Database`] wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueDbErrorKind {
    /// `SQLite` reported the database busy or locked after its busy timeout.
    BusyOrLocked,
    /// A CHECK, UNIQUE, NOT NULL or foreign key constraint rejected the write.
    ConstraintViolation,
    /// No pooled connection became available, or the pool was closed.
    PoolUnavailable,
    /// Anything else: IO, protocol, decode or unclassified errors.
    Other,
}

impl QueueDbErrorKind {
    /// Classifies a `sqlx` error.
    #[must_use]
    pub fn from_sqlx(error: &sqlx::Error) -> Self {
        match error {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => Self::PoolUnavailable,
            sqlx::Error::Database(db) => {
                // Extended result codes keep the primary code in the low byte.
                let primary = db
                    .code()
                    .and_then(|code| code.parse::<u32>().ok())
                    .map(|code| code & 0xff);
                if matches!(primary, Some(5 | 6)) || db.message().contains("is locked") {
                    Self::BusyOrLocked
                } else if primary == Some(19)
                    || db.is_unique_violation()
                    || db.is_foreign_key_violation()
                    || db.is_check_violation()
                {
                    Self::ConstraintViolation
                } else {
                    Self::Other
                }
            }
            _ => Self::Other,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BusyOrLocked => "busy",
            Self::ConstraintViolation => "constraint",
            Self::PoolUnavailable => "pool",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for QueueDbErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during queue operations.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    /// Database operation failed.
    #[error("database error ({kind}): {message}")]
    Database {
        /// Typed classification used for failure handling.
        kind: QueueDbErrorKind,
        /// Human-readable database error text.
        message: String,
    },

    /// Queue item not found.
    #[error(
        "queue item not found: id {0}\n  Suggestion: Run `manuscript-downloader list` to see current item IDs"
    )]
    ItemNotFound(i64),

    /// The requested state change is not allowed from the item's current state.
    #[error("item {id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// The item.
        id: i64,
        /// Current state.
        from: ItemState,
        /// Requested state.
        to: ItemState,
    },

    /// A persisted column held a value that does not parse.
    #[error("invalid {field} value '{value}' in queue database")]
    InvalidValue {
        /// Column name.
        field: &'static str,
        /// Raw stored value.
        value: String,
    },

    /// A page index outside the item's manifest.
    #[error("item {id} has no page {index}")]
    PageOutOfRange {
        /// The item.
        id: i64,
        /// Requested page index.
        index: usize,
    },
}

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database {
            kind: QueueDbErrorKind::from_sqlx(&err),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidValue {
            field: "json",
            value: err.to_string(),
        }
    }
}

impl QueueError {
    /// Creates an `InvalidTransition` error.
    #[must_use]
    pub fn invalid_transition(id: i64, from: ItemState, to: ItemState) -> Self {
        Self::InvalidTransition { id, from, to }
    }

    /// Creates an `InvalidValue` error for an unparseable stored column.
    #[must_use]
    pub fn invalid_value(field: &'static str, value: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            value: value.into(),
        }
    }

    /// True for a busy or locked database, where repeating the write can succeed.
    #[must_use]
    pub fn is_busy_or_locked(&self) -> bool {
        matches!(
            self,
            Self::Database {
                kind: QueueDbErrorKind::BusyOrLocked,
                ..
            }
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_database_error_names_its_kind() {
        let err = QueueError::Database {
            kind: QueueDbErrorKind::PoolUnavailable,
            message: "pool timed out".to_string(),
        };
        assert_eq!(err.to_string(), "database error (pool): pool timed out");
        assert!(!err.is_busy_or_locked());
    }

    #[test]
    fn test_pool_errors_are_classified() {
        let err = QueueError::from(sqlx::Error::PoolTimedOut);
        assert!(matches!(
            err,
            QueueError::Database {
                kind: QueueDbErrorKind::PoolUnavailable,
                ..
            }
        ));
        assert_eq!(
            QueueDbErrorKind::from_sqlx(&sqlx::Error::RowNotFound),
            QueueDbErrorKind::Other
        );
    }

    #[test]
    fn test_busy_flag() {
        let busy = QueueError::Database {
            kind: QueueDbErrorKind::BusyOrLocked,
            message: "database is locked".to_string(),
        };
        assert!(busy.is_busy_or_locked());
        assert!(!QueueError::ItemNotFound(1).is_busy_or_locked());
    }

    #[test]
    fn test_queue_error_item_not_found_message() {
        let msg = QueueError::ItemNotFound(42).to_string();
        assert!(msg.contains("not found"));
        assert!(msg.contains("42"));
        assert!(msg.contains("Suggestion"));
    }

    #[test]
    fn test_invalid_transition_message_names_states() {
        let err = QueueError::invalid_transition(7, ItemState::Completed, ItemState::Cancelled);
        assert_eq!(err.to_string(), "item 7 cannot move from completed to cancelled");
    }

    #[test]
    fn test_invalid_value_message() {
        let err = QueueError::invalid_value("state", "in_progress");
        assert!(err.to_string().contains("invalid state value 'in_progress'"));
    }
}
