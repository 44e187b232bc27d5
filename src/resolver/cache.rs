//! Persistent cache of resolved manifests, keyed by canonical URL.
//!
//! Cache failures never fail a resolution: a read error is a miss and a
//! write error is logged and dropped.

use std::time::Duration;

use sqlx::Row;
use tracing::{debug, instrument, warn};

use super::ResolvedManifest;
use crate::db::Database;
use crate::queue::{canonicalize_url, now_millis};

/// Manifests stored in the `manifest_cache` table.
#[derive(Debug, Clone)]
pub struct ManifestCache {
    db: Database,
    ttl: Option<Duration>,
}

impl ManifestCache {
    /// Entries older than `ttl` are treated as missing; `None` keeps them forever.
    #[must_use]
    pub fn new(db: Database, ttl: Option<Duration>) -> Self {
        Self { db, ttl }
    }

    #[must_use]
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// Cached manifest for `url`, if present and fresh.
    #[instrument(skip(self), fields(url = %url))]
    pub async fn get(&self, url: &str) -> Option<ResolvedManifest> {
        let key = canonicalize_url(url);
        let row = sqlx::query("SELECT manifest, cached_at FROM manifest_cache WHERE canonical_url = ?")
            .bind(&key)
            .fetch_optional(self.db.pool())
            .await;
        let row = match row {
            Ok(Some(row)) => row,
            Ok(None) => return None,
            Err(error) => {
                warn!(error = %error, "manifest cache read failed");
                return None;
            }
        };

        let cached_at: i64 = row.get("cached_at");
        if let Some(ttl) = self.ttl {
            let age = u64::try_from(now_millis().saturating_sub(cached_at)).unwrap_or(0);
            if u128::from(age) >= ttl.as_millis() {
                debug!(age_ms = age, "cached manifest expired");
                return None;
            }
        }

        let raw: String = row.get("manifest");
        match serde_json::from_str(&raw) {
            Ok(manifest) => Some(manifest),
            Err(error) => {
                warn!(error = %error, "cached manifest unreadable, ignoring");
                None
            }
        }
    }

    /// Stores `manifest` for `url`, replacing any earlier entry.
    #[instrument(skip(self, manifest), fields(url = %url, pages = manifest.pages.len()))]
    pub async fn put(&self, url: &str, manifest: &ResolvedManifest) {
        let raw = match serde_json::to_string(manifest) {
            Ok(raw) => raw,
            Err(error) => {
                warn!(error = %error, "manifest not cacheable");
                return;
            }
        };
        let result = sqlx::query(
            r"INSERT OR REPLACE INTO manifest_cache (canonical_url, manifest, cached_at)
              VALUES (?, ?, ?)",
        )
        .bind(canonicalize_url(url))
        .bind(raw)
        .bind(now_millis())
        .execute(self.db.pool())
        .await;
        if let Err(error) = result {
            warn!(error = %error, "manifest cache write failed");
        }
    }

    /// Removes every entry and returns how many there were.
    #[instrument(skip(self))]
    pub async fn clear(&self) -> u64 {
        match sqlx::query("DELETE FROM manifest_cache")
            .execute(self.db.pool())
            .await
        {
            Ok(result) => result.rows_affected(),
            Err(error) => {
                warn!(error = %error, "manifest cache clear failed");
                0
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::resolver::ManifestPage;

    fn manifest() -> ResolvedManifest {
        ResolvedManifest {
            display_name: "Psalter".into(),
            library: "Example".into(),
            pages: vec![
                ManifestPage::new("https://lib.example/0.jpg", "f1r"),
                ManifestPage::new("https://lib.example/1.jpg", "f1v"),
            ],
        }
    }

    async fn cache(ttl: Option<Duration>) -> ManifestCache {
        ManifestCache::new(Database::new_in_memory().await.unwrap(), ttl)
    }

    #[tokio::test]
    async fn test_put_then_get_by_canonical_url() {
        let cache = cache(None).await;
        assert!(cache.get("https://lib.example/ms/1").await.is_none());

        cache.put("https://lib.example/ms/1/", &manifest()).await;
        assert_eq!(cache.get("https://lib.example/ms/1#top").await, Some(manifest()));
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let cache = cache(Some(Duration::ZERO)).await;
        cache.put("https://lib.example/ms/1", &manifest()).await;
        assert!(cache.get("https://lib.example/ms/1").await.is_none());
    }

    #[tokio::test]
    async fn test_unreadable_entry_is_a_miss() {
        let cache = cache(None).await;
        sqlx::query("INSERT INTO manifest_cache (canonical_url, manifest, cached_at) VALUES (?, ?, ?)")
            .bind("https://lib.example/ms/2")
            .bind("{not json")
            .bind(now_millis())
            .execute(cache.db.pool())
            .await
            .unwrap();
        assert!(cache.get("https://lib.example/ms/2").await.is_none());
    }

    #[tokio::test]
    async fn test_clear_reports_removed_entries() {
        let cache = cache(None).await;
        cache.put("https://lib.example/ms/1", &manifest()).await;
        cache.put("https://lib.example/ms/2", &manifest()).await;

        assert_eq!(cache.clear().await, 2);
        assert!(cache.get("https://lib.example/ms/1").await.is_none());
        assert_eq!(cache.clear().await, 0);
    }
}
