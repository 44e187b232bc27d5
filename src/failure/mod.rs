//! Error taxonomy shared by resolution, fetching and assembly.
//!
//! Every error surfaced by the orchestrator maps onto one [`ErrorKind`]; the
//! kind (not the concrete error type) is what gets persisted on pages and
//! items and what drives retry decisions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Category of a failure, as recorded on pages and items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The manifest could not be produced. Terminal for the item.
    Resolution,
    /// Timeout, connection reset or similar. Transient.
    Network,
    /// Non-2xx HTTP response. Retryable only for 5xx/429.
    Server,
    /// Payload too small or of the wrong kind. Retryable up to the limit.
    Integrity,
    /// I/O failure while merging pages. Retryable without re-fetching.
    Assembly,
    /// User-initiated. Terminal, but not a failure.
    Cancellation,
}

impl ErrorKind {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Resolution => "resolution",
            Self::Network => "network",
            Self::Server => "server",
            Self::Integrity => "integrity",
            Self::Assembly => "assembly",
            Self::Cancellation => "cancellation",
        }
    }

    /// Returns the user-facing error class name.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Resolution => "ResolutionError",
            Self::Network => "NetworkError",
            Self::Server => "ServerError",
            Self::Integrity => "IntegrityError",
            Self::Assembly => "AssemblyError",
            Self::Cancellation => "CancellationError",
        }
    }

    /// Returns false only for user cancellation.
    #[must_use]
    pub fn is_failure(self) -> bool {
        !matches!(self, Self::Cancellation)
    }

    /// Returns a short hint on how to recover from this kind of failure.
    #[must_use]
    pub fn suggestion(self) -> &'static str {
        match self {
            Self::Resolution => "Check the source URL; the manifest could not be read.",
            Self::Network => "Check network connectivity, then `retry` the item.",
            Self::Server => "The library rejected a page request; `retry` later or verify the page URL.",
            Self::Integrity => "The library returned something other than a page image; `retry` later.",
            Self::Assembly => "Check free space and permissions on the output directory, then `retry`.",
            Self::Cancellation => "The item was cancelled; `retry` resumes it.",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "resolution" => Ok(Self::Resolution),
            "network" => Ok(Self::Network),
            "server" => Ok(Self::Server),
            "integrity" => Ok(Self::Integrity),
            "assembly" => Ok(Self::Assembly),
            "cancellation" => Ok(Self::Cancellation),
            _ => Err(format!("invalid error kind: {s}")),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_str_roundtrip() {
        for kind in [
            ErrorKind::Resolution,
            ErrorKind::Network,
            ErrorKind::Server,
            ErrorKind::Integrity,
            ErrorKind::Assembly,
            ErrorKind::Cancellation,
        ] {
            assert_eq!(kind.as_str().parse::<ErrorKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_error_kind_rejects_unknown() {
        let err = "timeout".parse::<ErrorKind>().unwrap_err();
        assert!(err.contains("invalid error kind"));
    }

    #[test]
    fn test_cancellation_is_not_a_failure() {
        assert!(!ErrorKind::Cancellation.is_failure());
        assert!(ErrorKind::Assembly.is_failure());
    }

    #[test]
    fn test_error_kind_label_names_error_class() {
        assert_eq!(ErrorKind::Integrity.label(), "IntegrityError");
        assert_eq!(ErrorKind::Server.to_string(), "server");
    }
}
