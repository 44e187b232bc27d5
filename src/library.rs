//! Per-library download policies.
//!
//! A [`LibraryPolicy`] gathers everything that differs between remote
//! libraries (concurrency cap, timeout scaling, retry budget, backoff and an
//! optional auto-split override). Policies are read-only at run time and are
//! looked up by library key through a [`PolicyTable`]; nothing branches on a
//! library's name.

use std::collections::HashMap;
use std::time::Duration;

use crate::download::{BackoffPolicy, DEFAULT_RETRY_LIMIT, RetryPolicy};

/// Default per-library concurrency cap.
pub const DEFAULT_LIBRARY_CONCURRENCY: usize = 4;

/// Library key used for items whose manifest named no library.
pub const UNKNOWN_LIBRARY: &str = "unknown";

/// Concurrency, timeout and retry settings for one library.
#[derive(Debug, Clone, PartialEq)]
pub struct LibraryPolicy {
    /// Maximum in-flight page fetches for this library.
    pub max_concurrent: usize,
    /// Multiplier applied to the base request timeout.
    pub timeout_multiplier: f64,
    /// Retries allowed after the first attempt of a page.
    pub retry_limit: u32,
    /// Backoff between attempts.
    pub backoff: BackoffPolicy,
    /// Overrides the global artifact byte threshold when set.
    pub split_max_bytes: Option<u64>,
}

impl Default for LibraryPolicy {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_LIBRARY_CONCURRENCY,
            timeout_multiplier: 1.0,
            retry_limit: DEFAULT_RETRY_LIMIT,
            backoff: BackoffPolicy::default(),
            split_max_bytes: None,
        }
    }
}

impl LibraryPolicy {
    /// Per-request deadline for this library.
    ///
    /// Non-finite or non-positive multipliers fall back to `1.0`.
    #[must_use]
    pub fn request_timeout(&self, base: Duration) -> Duration {
        let multiplier = if self.timeout_multiplier.is_finite() && self.timeout_multiplier > 0.0 {
            self.timeout_multiplier
        } else {
            1.0
        };
        base.mul_f64(multiplier)
    }

    /// Retry policy built from this library's budget and backoff.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_limit, self.backoff)
    }

    /// Concurrency cap, never below one.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.max_concurrent.max(1)
    }
}

/// Lookup table from library key to policy, with a default.
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    default: LibraryPolicy,
    libraries: HashMap<String, LibraryPolicy>,
}

impl PolicyTable {
    /// Creates a table where every library uses `default`.
    #[must_use]
    pub fn new(default: LibraryPolicy) -> Self {
        Self {
            default,
            libraries: HashMap::new(),
        }
    }

    /// Adds or replaces the policy for `library` (case-insensitive key).
    pub fn insert(&mut self, library: &str, policy: LibraryPolicy) {
        self.libraries.insert(normalize_key(library), policy);
    }

    /// Builder form of [`Self::insert`].
    #[must_use]
    pub fn with_library(mut self, library: &str, policy: LibraryPolicy) -> Self {
        self.insert(library, policy);
        self
    }

    /// Returns the policy for `library`, or the default.
    #[must_use]
    pub fn get(&self, library: &str) -> &LibraryPolicy {
        self.libraries
            .get(&normalize_key(library))
            .unwrap_or(&self.default)
    }

    /// The policy used for libraries without an entry.
    #[must_use]
    pub fn default_policy(&self) -> &LibraryPolicy {
        &self.default
    }

    /// Library keys with an explicit entry, sorted.
    #[must_use]
    pub fn libraries(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.libraries.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }
}

/// Normalizes a library name into its lookup key.
#[must_use]
pub fn normalize_key(library: &str) -> String {
    let trimmed = library.trim();
    if trimmed.is_empty() {
        UNKNOWN_LIBRARY.to_string()
    } else {
        trimmed.to_ascii_lowercase()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_falls_back_to_default() {
        let table = PolicyTable::default();
        assert_eq!(table.get("gallica"), &LibraryPolicy::default());
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let slow = LibraryPolicy {
            max_concurrent: 1,
            ..LibraryPolicy::default()
        };
        let table = PolicyTable::default().with_library("Gallica", slow.clone());
        assert_eq!(table.get("GALLICA"), &slow);
        assert_eq!(table.get(" gallica "), &slow);
        assert_eq!(table.libraries(), vec!["gallica"]);
    }

    #[test]
    fn test_request_timeout_scales_base() {
        let policy = LibraryPolicy {
            timeout_multiplier: 2.5,
            ..LibraryPolicy::default()
        };
        assert_eq!(
            policy.request_timeout(Duration::from_secs(30)),
            Duration::from_secs(75)
        );
    }

    #[test]
    fn test_request_timeout_ignores_invalid_multiplier() {
        let policy = LibraryPolicy {
            timeout_multiplier: 0.0,
            ..LibraryPolicy::default()
        };
        assert_eq!(
            policy.request_timeout(Duration::from_secs(30)),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_retry_policy_uses_library_budget() {
        let policy = LibraryPolicy {
            retry_limit: 7,
            ..LibraryPolicy::default()
        };
        assert_eq!(policy.retry_policy().max_attempts(), 8);
    }

    #[test]
    fn test_blank_library_maps_to_unknown_key() {
        assert_eq!(normalize_key("  "), UNKNOWN_LIBRARY);
        assert_eq!(normalize_key("BnF"), "bnf");
    }

    #[test]
    fn test_concurrency_never_zero() {
        let policy = LibraryPolicy {
            max_concurrent: 0,
            ..LibraryPolicy::default()
        };
        assert_eq!(policy.concurrency(), 1);
    }
}
