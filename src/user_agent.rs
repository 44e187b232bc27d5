//! Shared User-Agent strings for page and manifest HTTP clients.
//!
//! Libraries rate-limit anonymous scrapers aggressively; identifying the tool
//! with a contact URL keeps both kinds of traffic consistent (RFC 9308).

/// Project URL for User-Agent identification.
const PROJECT_UA_URL: &str = "https://github.com/fierce/manuscript-downloader";

/// Default User-Agent for page image requests.
#[must_use]
pub(crate) fn default_page_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("manuscript-downloader/{version} (digitized-manuscript-archiver; +{PROJECT_UA_URL})")
}

/// Default User-Agent for manifest requests.
#[must_use]
pub(crate) fn default_manifest_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("manuscript-downloader/{version} (manifest-resolver; +{PROJECT_UA_URL})")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn version_of(ua: &str) -> &str {
        ua.strip_prefix("manuscript-downloader/")
            .and_then(|rest| rest.split(' ').next())
            .unwrap()
    }

    #[test]
    fn test_user_agents_share_project_url_and_version() {
        let page_ua = default_page_user_agent();
        let manifest_ua = default_manifest_user_agent();

        assert!(page_ua.contains(PROJECT_UA_URL));
        assert!(manifest_ua.contains(PROJECT_UA_URL));
        assert_eq!(version_of(&page_ua), env!("CARGO_PKG_VERSION"));
        assert_eq!(version_of(&manifest_ua), env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_user_agents_name_their_role() {
        assert!(default_page_user_agent().contains("manuscript-archiver"));
        assert!(default_manifest_user_agent().contains("manifest-resolver"));
    }
}
