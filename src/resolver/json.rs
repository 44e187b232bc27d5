//! JSON manifest resolver.
//!
//! Fetches a document of the form
//! `{"displayName": "...", "library": "...", "pages": [{"url": "...", "label": "..."}]}`
//! and returns it unchanged apart from resolving relative page URLs against
//! the manifest URL.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::ACCEPT;
use tracing::debug;
use url::Url;

use super::{ManifestResolver, ResolveError, ResolvedManifest};
use crate::user_agent;

/// Default deadline for one manifest request.
pub const MANIFEST_TIMEOUT: Duration = Duration::from_secs(30);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolver for JSON manifests served over HTTP(S).
#[derive(Debug, Clone)]
pub struct JsonManifestResolver {
    client: Client,
}

impl JsonManifestResolver {
    /// Creates a resolver with [`MANIFEST_TIMEOUT`].
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::ResolutionFailed`] if the HTTP client cannot be built.
    pub fn new() -> Result<Self, ResolveError> {
        Self::with_timeout(MANIFEST_TIMEOUT)
    }

    /// Creates a resolver with an explicit request deadline.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::ResolutionFailed`] if the HTTP client cannot be built.
    pub fn with_timeout(timeout: Duration) -> Result<Self, ResolveError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .timeout(timeout)
            .gzip(true)
            .user_agent(user_agent::default_manifest_user_agent())
            .build()
            .map_err(|e| {
                ResolveError::resolution_failed("json", &format!("HTTP client construction failed: {e}"))
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ManifestResolver for JsonManifestResolver {
    fn name(&self) -> &'static str {
        "json"
    }

    fn can_handle(&self, url: &str) -> bool {
        Url::parse(url.trim()).is_ok_and(|parsed| matches!(parsed.scheme(), "http" | "https"))
    }

    #[tracing::instrument(skip(self), fields(resolver = "json"))]
    async fn resolve(&self, url: &str) -> Result<ResolvedManifest, ResolveError> {
        let base = Url::parse(url.trim())
            .map_err(|e| ResolveError::resolution_failed(url, &format!("invalid URL: {e}")))?;

        let response = self
            .client
            .get(base.clone())
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| ResolveError::resolution_failed(url, &format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ResolveError::resolution_failed(
                url,
                &format!("manifest request returned HTTP {}", status.as_u16()),
            ));
        }

        let mut manifest: ResolvedManifest = response
            .json()
            .await
            .map_err(|e| ResolveError::resolution_failed(url, &format!("invalid manifest JSON: {e}")))?;

        for page in &mut manifest.pages {
            let absolute = base.join(page.url.trim()).map_err(|e| {
                ResolveError::resolution_failed(url, &format!("invalid page URL '{}': {e}", page.url))
            })?;
            page.url = absolute.to_string();
        }

        debug!(pages = manifest.pages.len(), "manifest parsed");
        Ok(manifest)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_can_handle_http_only() {
        let resolver = JsonManifestResolver::new().unwrap();
        assert!(resolver.can_handle("https://lib.example/ms/1/manifest.json"));
        assert!(resolver.can_handle("http://localhost:8080/m"));
        assert!(!resolver.can_handle("file:///etc/hosts"));
        assert!(!resolver.can_handle("ms 42"));
    }

    #[tokio::test]
    async fn test_resolves_and_absolutizes_pages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ms/7/manifest.json"))
            .and(header("accept", "application/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "displayName": "Gradual",
                "library": "Example",
                "pages": [
                    {"url": "pages/1.jpg", "label": "1r"},
                    {"url": "https://cdn.example/2.jpg", "label": "1v"}
                ]
            })))
            .mount(&server)
            .await;

        let resolver = JsonManifestResolver::new().unwrap();
        let manifest = resolver
            .resolve(&format!("{}/ms/7/manifest.json", server.uri()))
            .await
            .unwrap();

        assert_eq!(manifest.display_name, "Gradual");
        assert_eq!(manifest.pages[0].url, format!("{}/ms/7/pages/1.jpg", server.uri()));
        assert_eq!(manifest.pages[1].url, "https://cdn.example/2.jpg");
    }

    #[tokio::test]
    async fn test_http_error_is_resolution_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = JsonManifestResolver::new()
            .unwrap()
            .resolve(&format!("{}/missing.json", server.uri()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("HTTP 404"));
    }

    #[tokio::test]
    async fn test_malformed_json_is_resolution_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>not json</html>"))
            .mount(&server)
            .await;

        let err = JsonManifestResolver::new()
            .unwrap()
            .resolve(&format!("{}/m.json", server.uri()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid manifest JSON"));
    }
}
