//! HTTP client wrapper for fetching page payloads.
//!
//! [`PageClient`] performs one GET per call with a per-request deadline and
//! cooperative cancellation. It never retries on its own: retry decisions
//! belong to the worker that owns the attempt.

use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use url::Url;

use super::error::FetchError;
use super::retry::parse_retry_after;
use super::validate::{MAX_PAGE_BYTES, ValidationFailure};
use crate::user_agent;

/// Default HTTP connect timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Raw response of a successful page request.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// Full response body.
    pub body: Vec<u8>,
    /// Declared `Content-Type`, if any.
    pub content_type: Option<String>,
    /// HTTP status code (always 2xx).
    pub status: u16,
}

/// HTTP client for page requests.
///
/// Created once and shared by every worker so connections are pooled.
/// Bodies longer than [`PageClient::max_body_bytes`] are abandoned mid-stream
/// and reported as [`FetchError::Integrity`].
///
/// # Example
///
/// ```no_run
/// use manuscript_core::download::PageClient;
/// use std::time::Duration;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = PageClient::new()?;
/// let page = client
///     .fetch("https://library.example/f1r.jpg", Duration::from_secs(30), &CancellationToken::new())
///     .await?;
/// println!("{} bytes", page.body.len());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct PageClient {
    client: Client,
    max_body_bytes: u64,
}

impl PageClient {
    /// Creates a client with the default connect timeout.
    ///
    /// # Errors
    ///
    /// Returns the underlying error if the TLS backend cannot be initialised.
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_connect_timeout(CONNECT_TIMEOUT)
    }

    /// Creates a client with an explicit connect timeout.
    ///
    /// # Errors
    ///
    /// Returns the underlying error if the TLS backend cannot be initialised.
    pub fn with_connect_timeout(connect_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .gzip(true)
            .user_agent(user_agent::default_page_user_agent())
            .build()?;
        Ok(Self {
            client,
            max_body_bytes: MAX_PAGE_BYTES,
        })
    }

    /// Sets the largest accepted response body.
    #[must_use]
    pub fn with_max_body_bytes(mut self, max_body_bytes: u64) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    /// Returns the largest accepted response body.
    #[must_use]
    pub fn max_body_bytes(&self) -> u64 {
        self.max_body_bytes
    }

    /// Fetches `url` within `timeout`, aborting early if `cancel` fires.
    ///
    /// # Errors
    ///
    /// - [`FetchError::InvalidUrl`] for non-http(s) or malformed URLs
    /// - [`FetchError::Timeout`] when the deadline expires
    /// - [`FetchError::HttpStatus`] for non-2xx responses (with `Retry-After`)
    /// - [`FetchError::Integrity`] when the body exceeds the size cap
    /// - [`FetchError::Network`] for transport failures
    /// - [`FetchError::Cancelled`] when `cancel` fires first
    #[instrument(skip(self, cancel), fields(url = %url, timeout_ms = timeout.as_millis()))]
    pub async fn fetch(
        &self,
        url: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<FetchedPage, FetchError> {
        let parsed = Url::parse(url).map_err(|_| FetchError::invalid_url(url))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FetchError::invalid_url(url));
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!("fetch cancelled");
                Err(FetchError::cancelled(url))
            }
            outcome = tokio::time::timeout(timeout, self.fetch_inner(parsed, url, timeout)) => {
                outcome.unwrap_or_else(|_| Err(FetchError::timeout(url, timeout)))
            }
        }
    }

    async fn fetch_inner(
        &self,
        parsed: Url,
        url: &str,
        timeout: Duration,
    ) -> Result<FetchedPage, FetchError> {
        let response = self
            .client
            .get(parsed)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_transport_error(url, timeout, e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_retry_after);
            debug!(status = status.as_u16(), ?retry_after, "page request rejected");
            return Err(FetchError::http_status(url, status.as_u16(), retry_after));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let too_large = || {
            FetchError::integrity(
                url,
                ValidationFailure::TooLarge {
                    max: self.max_body_bytes,
                },
            )
        };
        if response
            .content_length()
            .is_some_and(|declared| declared > self.max_body_bytes)
        {
            debug!(declared = ?response.content_length(), "declared body exceeds cap");
            return Err(too_large());
        }

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| map_transport_error(url, timeout, e))?;
            if (body.len() + chunk.len()) as u64 > self.max_body_bytes {
                debug!(received = body.len() + chunk.len(), "body exceeds cap");
                return Err(too_large());
            }
            body.extend_from_slice(&chunk);
        }

        debug!(bytes = body.len(), content_type = ?content_type, "page received");
        Ok(FetchedPage {
            body,
            content_type,
            status: status.as_u16(),
        })
    }
}

fn map_transport_error(url: &str, timeout: Duration, error: reqwest::Error) -> FetchError {
    if error.is_timeout() {
        FetchError::timeout(url, timeout)
    } else {
        FetchError::network(url, error)
    }
}
