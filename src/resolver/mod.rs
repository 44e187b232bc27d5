//! Manifest resolution: turning a submitted URL into an ordered page list.
//!
//! # Architecture
//!
//! - [`ManifestResolver`] - async trait implemented per manifest source
//! - [`ResolverRegistry`] - registration-ordered collection with fallback
//! - [`JsonManifestResolver`] - fetches a JSON manifest document over HTTP
//! - [`StaticResolver`] - in-memory manifests, for embedding and tests
//! - [`ManifestCache`] - persisted manifests consulted before any resolver
//!
//! The page order of a [`ResolvedManifest`] is final: the queue stores it
//! as-is and the assembler writes pages in exactly that order.
//!
//! # Example
//!
//! ```no_run
//! use manuscript_core::resolver::{JsonManifestResolver, ResolverRegistry};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut registry = ResolverRegistry::new();
//! registry.register(Box::new(JsonManifestResolver::new()?));
//!
//! let manifest = registry.resolve("https://library.example/ms/42/manifest.json").await?;
//! println!("{} pages of {}", manifest.pages.len(), manifest.display_name);
//! # Ok(())
//! # }
//! ```

mod cache;
mod error;
mod fixed;
mod json;
mod registry;

pub use cache::ManifestCache;
pub use error::ResolveError;
pub use fixed::StaticResolver;
pub use json::{JsonManifestResolver, MANIFEST_TIMEOUT};
pub use registry::ResolverRegistry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::queue::PageRef;

/// One page entry of a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestPage {
    pub url: String,
    #[serde(default)]
    pub label: String,
}

impl ManifestPage {
    #[must_use]
    pub fn new(url: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            label: label.into(),
        }
    }
}

/// Output of a resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedManifest {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub library: String,
    pub pages: Vec<ManifestPage>,
}

impl ResolvedManifest {
    /// Queued page refs, indexed by position.
    #[must_use]
    pub fn page_refs(&self) -> Vec<PageRef> {
        self.pages
            .iter()
            .enumerate()
            .map(|(index, page)| PageRef::new(index, page.url.clone(), page.label.clone()))
            .collect()
    }

    /// `display_name` unless blank.
    #[must_use]
    pub fn display_name(&self) -> Option<String> {
        non_blank(&self.display_name)
    }

    /// `library` unless blank.
    #[must_use]
    pub fn library(&self) -> Option<String> {
        non_blank(&self.library)
    }
}

fn non_blank(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// A source of manuscript manifests.
///
/// Uses `async_trait` so resolvers can be stored as `Box<dyn ManifestResolver>`.
#[async_trait]
pub trait ManifestResolver: Send + Sync {
    /// Short name used in logs (e.g. "json", "static").
    fn name(&self) -> &str;

    /// Returns true if this resolver should be tried for `url`.
    fn can_handle(&self, url: &str) -> bool;

    /// Produces the manifest for `url`.
    async fn resolve(&self, url: &str) -> Result<ResolvedManifest, ResolveError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::queue::{ExpectedKind, PageStatus};

    #[test]
    fn test_manifest_deserializes_camel_case() {
        let json = r#"{
            "displayName": "Book of Hours",
            "library": "Example Library",
            "pages": [
                {"url": "https://lib.example/f1r.jpg", "label": "f. 1r"},
                {"url": "https://lib.example/f1v.jpg"}
            ]
        }"#;
        let manifest: ResolvedManifest = serde_json::from_str(json).unwrap();
        assert_eq!(manifest.display_name, "Book of Hours");
        assert_eq!(manifest.pages.len(), 2);
        assert_eq!(manifest.pages[1].label, "");
    }

    #[test]
    fn test_page_refs_keep_manifest_order() {
        let manifest = ResolvedManifest {
            display_name: String::new(),
            library: "  ".into(),
            pages: vec![
                ManifestPage::new("https://lib.example/b.jpg", "b"),
                ManifestPage::new("https://lib.example/a.pdf", "a"),
            ],
        };
        let pages = manifest.page_refs();
        assert_eq!(pages[0].index, 0);
        assert_eq!(pages[0].label, "b");
        assert_eq!(pages[1].expected, ExpectedKind::Pdf);
        assert!(pages.iter().all(|page| page.status == PageStatus::Queued));
        assert_eq!(manifest.display_name(), None);
        assert_eq!(manifest.library(), None);
    }
}
