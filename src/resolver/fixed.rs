//! In-memory resolver.
//!
//! [`StaticResolver`] answers from a map of known manifests. It lets callers
//! that already hold page lists (and tests) skip the network entirely.

use std::collections::HashMap;

use async_trait::async_trait;

use super::{ManifestResolver, ResolveError, ResolvedManifest};
use crate::queue::canonicalize_url;

/// Resolver backed by a fixed URL-to-manifest map.
///
/// URLs are matched by their canonical form, so a trailing slash or fragment
/// does not matter.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    manifests: HashMap<String, ResolvedManifest>,
}

impl StaticResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the manifest for `url`.
    pub fn insert(&mut self, url: &str, manifest: ResolvedManifest) {
        self.manifests.insert(canonicalize_url(url), manifest);
    }

    /// Builder form of [`Self::insert`].
    #[must_use]
    pub fn with_manifest(mut self, url: &str, manifest: ResolvedManifest) -> Self {
        self.insert(url, manifest);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.manifests.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.manifests.is_empty()
    }
}

#[async_trait]
impl ManifestResolver for StaticResolver {
    fn name(&self) -> &'static str {
        "static"
    }

    fn can_handle(&self, url: &str) -> bool {
        self.manifests.contains_key(&canonicalize_url(url))
    }

    #[tracing::instrument(skip(self), fields(resolver = "static"))]
    async fn resolve(&self, url: &str) -> Result<ResolvedManifest, ResolveError> {
        self.manifests
            .get(&canonicalize_url(url))
            .cloned()
            .ok_or_else(|| ResolveError::resolution_failed(url, "no manifest registered for this URL"))
    }
}
