//! Error types for manifest resolution.
//!
//! Every variant maps to [`ErrorKind::Resolution`], which is terminal for the
//! item until the user retries it.

use thiserror::Error;

use crate::failure::ErrorKind;

/// Errors that can occur while turning a source URL into a manifest.
#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    /// No registered resolver accepts the input
    #[error("no resolver found for '{input}': {reason}\n  Suggestion: {suggestion}")]
    NoResolver {
        input: String,
        reason: String,
        suggestion: String,
    },

    /// A specific resolver failed
    #[error("resolution failed for '{input}': {reason}\n  Suggestion: {suggestion}")]
    ResolutionFailed {
        input: String,
        reason: String,
        suggestion: String,
    },

    /// The manifest listed no pages
    #[error("manifest for '{input}' has no pages\n  Suggestion: Check that the URL points at a complete manuscript")]
    EmptyManifest { input: String },

    /// Every applicable resolver failed
    #[error(
        "all resolvers failed for '{input}': tried {tried_count} resolver(s){}\n  Suggestion: Check the URL or try again later",
        last_error_suffix(.last_error)
    )]
    AllResolversFailed {
        input: String,
        tried_count: usize,
        last_error: Option<String>,
    },
}

impl ResolveError {
    /// Creates a `NoResolver` error.
    #[must_use]
    pub fn no_resolver(input: &str) -> Self {
        Self::NoResolver {
            input: input.to_string(),
            reason: "no registered resolver can handle this URL".to_string(),
            suggestion: "Check the URL or add a manifest resolver for this library".to_string(),
        }
    }

    /// Creates a `ResolutionFailed` error.
    #[must_use]
    pub fn resolution_failed(input: &str, reason: &str) -> Self {
        Self::ResolutionFailed {
            input: input.to_string(),
            reason: reason.to_string(),
            suggestion: "Check the URL and try again".to_string(),
        }
    }

    /// Creates an `EmptyManifest` error.
    #[must_use]
    pub fn empty_manifest(input: &str) -> Self {
        Self::EmptyManifest {
            input: input.to_string(),
        }
    }

    /// Creates an `AllResolversFailed` error.
    #[must_use]
    pub fn all_failed(input: &str, tried_count: usize, last_error: Option<&ResolveError>) -> Self {
        Self::AllResolversFailed {
            input: input.to_string(),
            tried_count,
            last_error: last_error.map(short_reason),
        }
    }

    /// Taxonomy kind; always [`ErrorKind::Resolution`].
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Resolution
    }
}

fn last_error_suffix(last_error: &Option<String>) -> String {
    last_error
        .as_deref()
        .map(|error| format!(", last error: {error}"))
        .unwrap_or_default()
}

/// The first line of an error, without its suggestion.
fn short_reason(error: &ResolveError) -> String {
    error
        .to_string()
        .lines()
        .next()
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_no_resolver_message() {
        let err = ResolveError::no_resolver("https://unknown.example/ms");
        let msg = err.to_string();
        assert!(msg.contains("unknown.example"));
        assert!(msg.contains("no resolver"));
        assert!(msg.contains("Suggestion"));
    }

    #[test]
    fn test_all_failed_includes_last_reason_once() {
        let last = ResolveError::resolution_failed("https://lib.example/ms", "HTTP 500");
        let err = ResolveError::all_failed("https://lib.example/ms", 2, Some(&last));
        let msg = err.to_string();
        assert!(msg.contains("tried 2 resolver(s)"));
        assert!(msg.contains("HTTP 500"));
        assert_eq!(msg.matches("Suggestion").count(), 1);
    }

    #[test]
    fn test_every_variant_is_resolution_kind() {
        for err in [
            ResolveError::no_resolver("a"),
            ResolveError::resolution_failed("a", "b"),
            ResolveError::empty_manifest("a"),
            ResolveError::all_failed("a", 0, None),
        ] {
            assert_eq!(err.kind(), ErrorKind::Resolution);
        }
    }
}
