//! Resolver registry with a registration-ordered fallback loop.

use tracing::{debug, info, instrument, warn};

use super::{ManifestCache, ManifestResolver, ResolveError, ResolvedManifest};

/// Resolvers tried in registration order; the first success wins.
pub struct ResolverRegistry {
    resolvers: Vec<Box<dyn ManifestResolver>>,
    cache: Option<ManifestCache>,
}

impl ResolverRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            resolvers: Vec::new(),
            cache: None,
        }
    }

    /// Answers repeated URLs from `cache` and stores every fresh resolution.
    #[must_use]
    pub fn with_cache(mut self, cache: ManifestCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Empties the manifest cache, if any. Returns the entries removed.
    pub async fn clear_cache(&self) -> u64 {
        match &self.cache {
            Some(cache) => cache.clear().await,
            None => 0,
        }
    }

    /// Appends a resolver.
    #[instrument(skip(self, resolver), fields(resolver_name = resolver.name()))]
    pub fn register(&mut self, resolver: Box<dyn ManifestResolver>) {
        debug!("registering resolver");
        self.resolvers.push(resolver);
    }

    #[must_use]
    pub fn resolver_count(&self) -> usize {
        self.resolvers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }

    /// Resolvers accepting `url`, in registration order.
    #[must_use]
    pub fn find_handlers(&self, url: &str) -> Vec<&dyn ManifestResolver> {
        self.resolvers
            .iter()
            .filter(|resolver| resolver.can_handle(url))
            .map(AsRef::as_ref)
            .collect()
    }

    /// Resolves `url` from the cache or with the first handler that succeeds.
    ///
    /// A manifest without pages counts as a failure of that handler.
    ///
    /// # Errors
    ///
    /// - [`ResolveError::NoResolver`] if no handler accepts the URL
    /// - [`ResolveError::AllResolversFailed`] if every handler failed
    #[instrument(skip(self), fields(url = %url))]
    pub async fn resolve(&self, url: &str) -> Result<ResolvedManifest, ResolveError> {
        if let Some(cache) = &self.cache
            && let Some(manifest) = cache.get(url).await
            && !manifest.pages.is_empty()
        {
            debug!(pages = manifest.pages.len(), "manifest cache hit");
            return Ok(manifest);
        }

        let manifest = self.resolve_uncached(url).await?;
        if let Some(cache) = &self.cache {
            cache.put(url, &manifest).await;
        }
        Ok(manifest)
    }

    async fn resolve_uncached(&self, url: &str) -> Result<ResolvedManifest, ResolveError> {
        let handlers = self.find_handlers(url);
        if handlers.is_empty() {
            return Err(ResolveError::no_resolver(url));
        }

        let mut last_error = None;
        for handler in &handlers {
            debug!(resolver = handler.name(), "trying resolver");
            match handler.resolve(url).await {
                Ok(manifest) if manifest.pages.is_empty() => {
                    warn!(resolver = handler.name(), "resolver returned an empty manifest");
                    last_error = Some(ResolveError::empty_manifest(url));
                }
                Ok(manifest) => {
                    info!(
                        resolver = handler.name(),
                        pages = manifest.pages.len(),
                        library = %manifest.library,
                        "manifest resolved"
                    );
                    return Ok(manifest);
                }
                Err(error) => {
                    warn!(resolver = handler.name(), error = %error, "resolver failed, trying next");
                    last_error = Some(error);
                }
            }
        }

        Err(ResolveError::all_failed(url, handlers.len(), last_error.as_ref()))
    }
}

impl std::fmt::Debug for ResolverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.resolvers.iter().map(|r| r.name()).collect();
        f.debug_struct("ResolverRegistry")
            .field("resolver_count", &self.resolvers.len())
            .field("resolvers", &names)
            .field("cached", &self.cache.is_some())
            .finish()
    }
}

impl Default for ResolverRegistry {
    fn default() -> Self {
        Self::new()
    }
}
