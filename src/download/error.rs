//! Error types for page fetching.
//!
//! A [`FetchError`] describes why one attempt at one page failed. Each variant
//! maps onto an [`ErrorKind`] and carries enough context (url, status, path)
//! to explain the failure once it is recorded on the page.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use super::validate::ValidationFailure;
use crate::failure::ErrorKind;

/// Errors that can occur while fetching and storing a single page.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS resolution, connection refused, reset, etc.)
    #[error("network error fetching {url}: {source}")]
    Network {
        /// The page URL.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// The per-request deadline expired.
    #[error("timeout after {}s fetching {url}", .after.as_secs_f64())]
    Timeout {
        /// The page URL.
        url: String,
        /// Deadline that was exceeded.
        after: Duration,
    },

    /// Non-success HTTP response.
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        /// The page URL.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// Parsed Retry-After delay, if the server sent one.
        retry_after: Option<Duration>,
    },

    /// The payload failed integrity validation.
    #[error("integrity check failed for {url}: {failure}")]
    Integrity {
        /// The page URL.
        url: String,
        /// What was wrong with the payload.
        #[source]
        failure: ValidationFailure,
    },

    /// Writing the validated payload to disk failed.
    #[error("IO error writing {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The page URL is malformed.
    #[error("invalid page URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// The owning item was cancelled while the request was in flight.
    #[error("fetch of {url} cancelled")]
    Cancelled {
        /// The page URL.
        url: String,
    },
}

impl FetchError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            url: url.into(),
            after,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16, retry_after: Option<Duration>) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Creates an integrity error.
    pub fn integrity(url: impl Into<String>, failure: ValidationFailure) -> Self {
        Self::Integrity {
            url: url.into(),
            failure,
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a cancellation error.
    pub fn cancelled(url: impl Into<String>) -> Self {
        Self::Cancelled { url: url.into() }
    }

    /// Maps this error onto the shared taxonomy.
    ///
    /// Local write failures count as integrity failures: the page is not
    /// usable and another attempt may succeed.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network { .. } | Self::Timeout { .. } => ErrorKind::Network,
            Self::HttpStatus { .. } => ErrorKind::Server,
            Self::Integrity { .. } | Self::Io { .. } => ErrorKind::Integrity,
            Self::InvalidUrl { .. } => ErrorKind::Resolution,
            Self::Cancelled { .. } => ErrorKind::Cancellation,
        }
    }

    /// Returns true when another attempt could succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } | Self::Integrity { .. } | Self::Io { .. } => {
                true
            }
            Self::HttpStatus { status, .. } => is_retryable_status(*status),
            Self::InvalidUrl { .. } | Self::Cancelled { .. } => false,
        }
    }

    /// Returns the HTTP status code, when the failure was an HTTP response.
    #[must_use]
    pub fn http_status_code(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns the server-requested delay before the next attempt, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::HttpStatus { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// 5xx and 429 are worth retrying; every other status is terminal.
#[must_use]
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500..=599)
}
