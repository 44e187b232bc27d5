//! Queue item and page types, plus the item state machine.

use std::fmt;
use std::ops::Range;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::failure::ErrorKind;
use crate::library::normalize_key;

/// Stable identifier of a queue item (assigned by the database, monotonic).
pub type ItemId = i64;

/// Lifecycle state of a queue item.
///
/// `Pending → Resolving → Downloading ⇄ RetryWait → Assembling → Completed`;
/// any non-terminal state may also move to `Failed` or `Cancelled`. Items that
/// have not started assembling can be held in `Paused` and resumed later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    /// Submitted, manifest not yet requested.
    Pending,
    /// Manifest resolution in progress.
    Resolving,
    /// At least one page is queued or being fetched.
    Downloading,
    /// Every outstanding page is waiting out a backoff delay.
    RetryWait,
    /// All pages validated; artifacts are being written.
    Assembling,
    /// Held by the user; validated pages are kept and nothing is dispatched.
    Paused,
    /// Artifacts written.
    Completed,
    /// Terminal failure, see `failure`.
    Failed,
    /// Cancelled by the user.
    Cancelled,
}

impl ItemState {
    /// Every state, in lifecycle order.
    pub const ALL: [Self; 9] = [
        Self::Pending,
        Self::Resolving,
        Self::Downloading,
        Self::RetryWait,
        Self::Assembling,
        Self::Paused,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolving => "resolving",
            Self::Downloading => "downloading",
            Self::RetryWait => "retry_wait",
            Self::Assembling => "assembling",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Completed, Failed and Cancelled are terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// True for states a user may pause.
    #[must_use]
    pub fn is_pausable(self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Resolving | Self::Downloading | Self::RetryWait
        )
    }

    /// Returns true if `next` is a legal forward transition from `self`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Pending, Self::Resolving)
            | (Self::Resolving | Self::RetryWait, Self::Downloading)
            | (Self::Downloading, Self::RetryWait | Self::Assembling)
            | (Self::Assembling, Self::Completed)
            | (Self::Paused, Self::Pending | Self::Downloading | Self::Assembling) => true,
            (current, Self::Paused) => current.is_pausable(),
            (current, Self::Failed | Self::Cancelled) => !current.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("invalid item state: {s}"))
    }
}

/// Fetch state of a single page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    /// Waiting for dispatch.
    Queued,
    /// A worker holds this page.
    Fetching,
    /// Stored on disk and verified.
    Validated,
    /// Last attempt failed; retryable while `retry_at` is set.
    Failed,
}

impl PageStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Fetching => "fetching",
            Self::Validated => "validated",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for PageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "fetching" => Ok(Self::Fetching),
            "validated" => Ok(Self::Validated),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid page status: {s}")),
        }
    }
}

/// Payload kind a page is expected to contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedKind {
    Image,
    Pdf,
    /// Unknown; any recognized signature is accepted.
    Any,
}

impl ExpectedKind {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Pdf => "pdf",
            Self::Any => "any",
        }
    }

    /// Infers the kind from the extension of a page URL's path.
    #[must_use]
    pub fn from_url(url: &str) -> Self {
        let path = url::Url::parse(url)
            .map(|parsed| parsed.path().to_string())
            .unwrap_or_else(|_| url.split(['?', '#']).next().unwrap_or_default().to_string());
        let extension = path
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();

        match extension.as_str() {
            "pdf" => Self::Pdf,
            "jpg" | "jpeg" | "png" | "gif" | "webp" | "tif" | "tiff" | "jp2" => Self::Image,
            _ => Self::Any,
        }
    }
}

impl fmt::Display for ExpectedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExpectedKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(Self::Image),
            "pdf" => Ok(Self::Pdf),
            "any" => Ok(Self::Any),
            _ => Err(format!("invalid expected kind: {s}")),
        }
    }
}

/// Pages of a manifest selected at submission, 1-based and inclusive.
///
/// `end: None` runs to the last page. Parsed from `"3-10"`, `"3-"` or `"7"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRange {
    pub start: usize,
    pub end: Option<usize>,
}

impl PageRange {
    /// Creates a range, rejecting page 0 and reversed bounds.
    ///
    /// # Errors
    ///
    /// Returns a message naming the bad bound.
    pub fn new(start: usize, end: Option<usize>) -> Result<Self, String> {
        if start == 0 {
            return Err("page numbers start at 1".to_string());
        }
        if let Some(end) = end
            && end < start
        {
            return Err(format!("page range {start}-{end} ends before it starts"));
        }
        Ok(Self { start, end })
    }

    /// 0-based indexes of the selected pages in a manifest of `total` pages.
    ///
    /// An end past the last page is clamped.
    ///
    /// # Errors
    ///
    /// Returns a message when the range starts after the last page.
    pub fn select(&self, total: usize) -> Result<Range<usize>, String> {
        if self.start > total {
            return Err(format!(
                "page range {self} starts after the last page ({total})"
            ));
        }
        let end = self.end.map_or(total, |end| end.min(total));
        Ok(self.start - 1..end)
    }
}

impl fmt::Display for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "{}-{end}", self.start),
            None => write!(f, "{}-", self.start),
        }
    }
}

impl FromStr for PageRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |raw: &str| {
            raw.trim()
                .parse::<usize>()
                .map_err(|_| format!("invalid page range: {s}"))
        };
        match s.split_once('-') {
            Some((start, end)) if end.trim().is_empty() => Self::new(parse(start)?, None),
            Some((start, end)) => Self::new(parse(start)?, Some(parse(end)?)),
            None => {
                let page = parse(s)?;
                Self::new(page, Some(page))
            }
        }
    }
}

/// One page of one item.
///
/// Invariant: `local_path` is `Some` (and the file exists) iff
/// `status == Validated`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageRef {
    /// 0-based position; defines assembly order.
    pub index: usize,
    pub url: String,
    pub label: String,
    pub expected: ExpectedKind,
    pub status: PageStatus,
    /// Attempts started so far.
    pub attempt: u32,
    pub byte_size: Option<u64>,
    pub local_path: Option<PathBuf>,
    /// Hex SHA-256 of the stored file.
    pub sha256: Option<String>,
    /// Unix millis after which a failed page may be retried.
    pub retry_at: Option<i64>,
    pub error_kind: Option<ErrorKind>,
    pub last_error: Option<String>,
}

impl PageRef {
    /// Creates a queued page.
    #[must_use]
    pub fn new(index: usize, url: impl Into<String>, label: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            index,
            expected: ExpectedKind::from_url(&url),
            url,
            label: label.into(),
            status: PageStatus::Queued,
            attempt: 0,
            byte_size: None,
            local_path: None,
            sha256: None,
            retry_at: None,
            error_kind: None,
            last_error: None,
        }
    }

    /// True when the scheduler may dispatch this page at `now` (unix millis).
    #[must_use]
    pub fn is_eligible(&self, now: i64) -> bool {
        match self.status {
            PageStatus::Queued => true,
            PageStatus::Failed => self.retry_at.is_some_and(|at| at <= now),
            PageStatus::Fetching | PageStatus::Validated => false,
        }
    }

    /// Failed but scheduled for another attempt.
    #[must_use]
    pub fn is_retry_pending(&self) -> bool {
        self.status == PageStatus::Failed && self.retry_at.is_some()
    }

    /// Failed with no attempts left.
    #[must_use]
    pub fn is_terminal_failure(&self) -> bool {
        self.status == PageStatus::Failed && self.retry_at.is_none()
    }

    /// Drops any stored-file fields and puts the page back in the queue.
    pub fn reset_to_queued(&mut self) {
        self.status = PageStatus::Queued;
        self.local_path = None;
        self.byte_size = None;
        self.sha256 = None;
        self.retry_at = None;
    }
}

/// Cause recorded on an item that reached `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    pub kind: ErrorKind,
    pub message: String,
    /// Indexes of the pages that caused the failure (may be empty).
    pub pages: Vec<usize>,
}

impl fmt::Display for ItemFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.label(), self.message)
    }
}

/// How an exhausted page affects the rest of its item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureMode {
    /// Fail the item at the first exhausted page and abort its other fetches.
    #[default]
    FailFast,
    /// Keep fetching the remaining pages, then fail.
    BestEffort,
}

impl FailureMode {
    /// Returns the configuration string representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FailFast => "fail_fast",
            Self::BestEffort => "best_effort",
        }
    }
}

impl FromStr for FailureMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fail_fast" => Ok(Self::FailFast),
            "best_effort" => Ok(Self::BestEffort),
            _ => Err(format!("invalid failure mode: {s}")),
        }
    }
}

/// Where a resolved item stands, derived purely from its pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadPhase {
    /// Some page is queued or being fetched.
    Downloading,
    /// Only backoff timers remain.
    RetryWait,
    /// Every page is validated.
    ReadyToAssemble,
    /// The item cannot complete; lists the terminally failed pages.
    Failed { pages: Vec<usize> },
}

/// One requested manuscript.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueItem {
    pub id: ItemId,
    pub source_url: String,
    /// Normalized `source_url` used for duplicate detection.
    pub canonical_url: String,
    pub library: Option<String>,
    pub display_name: Option<String>,
    pub state: ItemState,
    /// Subset of the manifest requested at submission.
    pub page_range: Option<PageRange>,
    /// Fixed at resolution time; never reordered.
    pub pages: Vec<PageRef>,
    /// Retries scheduled across all pages.
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub failure: Option<ItemFailure>,
    /// Produced artifacts, in part order.
    pub outputs: Vec<PathBuf>,
    /// Unix millis.
    pub created_at: i64,
    /// Unix millis.
    pub updated_at: i64,
}

impl QueueItem {
    /// Policy lookup key for this item's library.
    #[must_use]
    pub fn library_key(&self) -> String {
        normalize_key(self.library.as_deref().unwrap_or_default())
    }

    /// True once a manifest has populated the pages.
    #[must_use]
    pub fn has_manifest(&self) -> bool {
        !self.pages.is_empty()
    }

    #[must_use]
    pub fn total_pages(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub fn validated_pages(&self) -> usize {
        self.pages
            .iter()
            .filter(|page| page.status == PageStatus::Validated)
            .count()
    }

    /// Total size of validated pages.
    #[must_use]
    pub fn validated_bytes(&self) -> u64 {
        self.pages
            .iter()
            .filter(|page| page.status == PageStatus::Validated)
            .filter_map(|page| page.byte_size)
            .sum()
    }

    /// True when every page is validated.
    #[must_use]
    pub fn all_validated(&self) -> bool {
        self.has_manifest() && self.validated_pages() == self.pages.len()
    }

    /// Attempts started across all pages.
    #[must_use]
    pub fn total_attempts(&self) -> u64 {
        self.pages.iter().map(|page| u64::from(page.attempt)).sum()
    }

    /// Indexes of pages the scheduler may dispatch at `now`, ascending.
    pub fn eligible_pages(&self, now: i64) -> impl Iterator<Item = usize> + '_ {
        self.pages
            .iter()
            .filter(move |page| page.is_eligible(now))
            .map(|page| page.index)
    }

    /// Earliest pending retry time among failed pages.
    #[must_use]
    pub fn next_retry_at(&self) -> Option<i64> {
        self.pages
            .iter()
            .filter(|page| page.is_retry_pending())
            .filter_map(|page| page.retry_at)
            .min()
    }

    /// Indexes of pages that failed with no attempts left.
    #[must_use]
    pub fn terminally_failed_pages(&self) -> Vec<usize> {
        self.pages
            .iter()
            .filter(|page| page.is_terminal_failure())
            .map(|page| page.index)
            .collect()
    }

    /// The single predicate deciding where a resolved item stands.
    #[must_use]
    pub fn download_phase(&self, mode: FailureMode) -> DownloadPhase {
        if !self.has_manifest() {
            return DownloadPhase::Failed { pages: Vec::new() };
        }

        let failed = self.terminally_failed_pages();
        let active = self
            .pages
            .iter()
            .any(|page| matches!(page.status, PageStatus::Queued | PageStatus::Fetching));
        let waiting = self.pages.iter().any(PageRef::is_retry_pending);

        if !failed.is_empty() && (mode == FailureMode::FailFast || !(active || waiting)) {
            return DownloadPhase::Failed { pages: failed };
        }

        if self.all_validated() {
            DownloadPhase::ReadyToAssemble
        } else if active {
            DownloadPhase::Downloading
        } else {
            DownloadPhase::RetryWait
        }
    }

    /// Manifest position of `pages[0]`; 0 unless a page range was requested.
    #[must_use]
    pub fn page_offset(&self) -> usize {
        self.page_range.map_or(0, |range| range.start - 1)
    }

    /// Where a paused item continues once resumed.
    #[must_use]
    pub fn resume_state(&self) -> ItemState {
        if !self.has_manifest() {
            ItemState::Pending
        } else if self.all_validated() {
            ItemState::Assembling
        } else {
            ItemState::Downloading
        }
    }

    /// Base name used for output artifacts.
    ///
    /// A requested page range is appended as `_pages_<first>-<last>`.
    #[must_use]
    pub fn output_name(&self) -> String {
        let base = match self.display_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("item_{}", self.id),
        };
        match self.page_range {
            Some(_) if self.has_manifest() => format!(
                "{base}_pages_{}-{}",
                self.page_offset() + 1,
                self.page_offset() + self.total_pages()
            ),
            _ => base,
        }
    }
}

impl fmt::Display for QueueItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QueueItem {{ id: {}, url: {}, state: {}, pages: {}/{} }}",
            self.id,
            self.source_url,
            self.state,
            self.validated_pages(),
            self.total_pages()
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn item_with_pages(statuses: &[PageStatus]) -> QueueItem {
        let pages = statuses
            .iter()
            .enumerate()
            .map(|(index, status)| {
                let mut page = PageRef::new(index, format!("https://lib.example/p{index}.jpg"), "");
                page.status = *status;
                if *status == PageStatus::Validated {
                    page.local_path = Some(PathBuf::from(format!("/tmp/p{index}.jpg")));
                    page.byte_size = Some(2048);
                }
                page
            })
            .collect();
        QueueItem {
            id: 1,
            source_url: "https://lib.example/ms/1".to_string(),
            canonical_url: "https://lib.example/ms/1".to_string(),
            library: Some("Example".to_string()),
            display_name: Some("Codex 1".to_string()),
            state: ItemState::Downloading,
            page_range: None,
            pages,
            retry_count: 0,
            last_error: None,
            failure: None,
            outputs: Vec::new(),
            created_at: 0,
            updated_at: 0,
        }
    }

    // ==================== ItemState Tests ====================

    #[test]
    fn test_item_state_str_roundtrip() {
        for state in ItemState::ALL {
            assert_eq!(state.as_str().parse::<ItemState>().unwrap(), state);
        }
        assert!("in_progress".parse::<ItemState>().is_err());
    }

    #[test]
    fn test_forward_transitions_allowed() {
        use ItemState::*;
        assert!(Pending.can_transition_to(Resolving));
        assert!(Resolving.can_transition_to(Downloading));
        assert!(Downloading.can_transition_to(RetryWait));
        assert!(RetryWait.can_transition_to(Downloading));
        assert!(Downloading.can_transition_to(Assembling));
        assert!(Assembling.can_transition_to(Completed));
    }

    #[test]
    fn test_backward_and_skipping_transitions_rejected() {
        use ItemState::*;
        assert!(!Resolving.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Downloading));
        assert!(!Downloading.can_transition_to(Completed));
        assert!(!RetryWait.can_transition_to(Assembling));
        assert!(!Assembling.can_transition_to(Downloading));
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        use ItemState::*;
        for terminal in [Completed, Failed, Cancelled] {
            for next in ItemState::ALL {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn test_any_active_state_can_fail_or_cancel() {
        use ItemState::*;
        for state in [Pending, Resolving, Downloading, RetryWait, Assembling, Paused] {
            assert!(state.can_transition_to(Failed));
            assert!(state.can_transition_to(Cancelled));
        }
    }

    #[test]
    fn test_pause_transitions() {
        use ItemState::*;
        for state in [Pending, Resolving, Downloading, RetryWait] {
            assert!(state.can_transition_to(Paused), "{state} -> paused");
        }
        assert!(!Assembling.can_transition_to(Paused));
        assert!(!Paused.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Pending));
        assert!(Paused.can_transition_to(Downloading));
        assert!(Paused.can_transition_to(Assembling));
        assert!(!Paused.can_transition_to(Resolving));
        assert!(!Paused.can_transition_to(Completed));
        assert!(!Paused.is_terminal());
    }

    #[test]
    fn test_resume_state_follows_pages() {
        let item = item_with_pages(&[]);
        assert_eq!(item.resume_state(), ItemState::Pending);

        let item = item_with_pages(&[PageStatus::Validated, PageStatus::Queued]);
        assert_eq!(item.resume_state(), ItemState::Downloading);

        let item = item_with_pages(&[PageStatus::Validated, PageStatus::Validated]);
        assert_eq!(item.resume_state(), ItemState::Assembling);
    }

    // ==================== PageRange Tests ====================

    #[test]
    fn test_page_range_parse_forms() {
        assert_eq!(
            "3-10".parse::<PageRange>().unwrap(),
            PageRange { start: 3, end: Some(10) }
        );
        assert_eq!("5-".parse::<PageRange>().unwrap(), PageRange { start: 5, end: None });
        assert_eq!("7".parse::<PageRange>().unwrap(), PageRange { start: 7, end: Some(7) });
        assert_eq!("3-10".parse::<PageRange>().unwrap().to_string(), "3-10");
        assert_eq!("5-".parse::<PageRange>().unwrap().to_string(), "5-");

        assert!("0-4".parse::<PageRange>().is_err());
        assert!("9-2".parse::<PageRange>().is_err());
        assert!("a-b".parse::<PageRange>().is_err());
        assert!("".parse::<PageRange>().is_err());
    }

    #[test]
    fn test_page_range_select_clamps_end() {
        let range = PageRange::new(3, Some(10)).unwrap();
        assert_eq!(range.select(12).unwrap(), 2..10);
        assert_eq!(range.select(6).unwrap(), 2..6);
        assert_eq!(PageRange::new(2, None).unwrap().select(4).unwrap(), 1..4);

        let err = range.select(2).unwrap_err();
        assert!(err.contains("starts after the last page (2)"), "{err}");
    }

    #[test]
    fn test_output_name_includes_page_range() {
        let mut item = item_with_pages(&[PageStatus::Queued, PageStatus::Queued]);
        item.page_range = Some(PageRange::new(4, None).unwrap());
        assert_eq!(item.page_offset(), 3);
        assert_eq!(item.output_name(), "Codex 1_pages_4-5");
    }

    // ==================== PageRef Tests ====================

    #[test]
    fn test_expected_kind_from_url() {
        assert_eq!(
            ExpectedKind::from_url("https://iiif.example/ark/f1/full/full/0/default.jpg"),
            ExpectedKind::Image
        );
        assert_eq!(
            ExpectedKind::from_url("https://lib.example/scan.PDF?download=1"),
            ExpectedKind::Pdf
        );
        assert_eq!(
            ExpectedKind::from_url("https://lib.example/page/12"),
            ExpectedKind::Any
        );
    }

    #[test]
    fn test_page_eligibility() {
        let mut page = PageRef::new(0, "https://lib.example/p0.jpg", "f1r");
        assert!(page.is_eligible(0));

        page.status = PageStatus::Failed;
        page.retry_at = Some(1_000);
        assert!(!page.is_eligible(999));
        assert!(page.is_eligible(1_000));
        assert!(page.is_retry_pending());

        page.retry_at = None;
        assert!(!page.is_eligible(i64::MAX));
        assert!(page.is_terminal_failure());

        page.status = PageStatus::Fetching;
        assert!(!page.is_eligible(i64::MAX));
    }

    // ==================== DownloadPhase Tests ====================

    #[test]
    fn test_phase_all_validated_is_ready() {
        let item = item_with_pages(&[PageStatus::Validated, PageStatus::Validated]);
        assert_eq!(
            item.download_phase(FailureMode::FailFast),
            DownloadPhase::ReadyToAssemble
        );
    }

    #[test]
    fn test_phase_queued_page_is_downloading() {
        let item = item_with_pages(&[PageStatus::Validated, PageStatus::Queued]);
        assert_eq!(
            item.download_phase(FailureMode::FailFast),
            DownloadPhase::Downloading
        );
    }

    #[test]
    fn test_phase_only_backoff_left_is_retry_wait() {
        let mut item = item_with_pages(&[PageStatus::Validated, PageStatus::Failed]);
        item.pages[1].retry_at = Some(5_000);
        assert_eq!(
            item.download_phase(FailureMode::FailFast),
            DownloadPhase::RetryWait
        );
        assert_eq!(item.next_retry_at(), Some(5_000));
    }

    #[test]
    fn test_phase_fail_fast_fails_on_first_exhausted_page() {
        let item = item_with_pages(&[PageStatus::Fetching, PageStatus::Failed, PageStatus::Queued]);
        assert_eq!(
            item.download_phase(FailureMode::FailFast),
            DownloadPhase::Failed { pages: vec![1] }
        );
    }

    #[test]
    fn test_phase_best_effort_waits_for_outstanding_pages() {
        let mut item =
            item_with_pages(&[PageStatus::Fetching, PageStatus::Failed, PageStatus::Validated]);
        assert_eq!(
            item.download_phase(FailureMode::BestEffort),
            DownloadPhase::Downloading
        );

        item.pages[0].status = PageStatus::Validated;
        item.pages[0].local_path = Some(PathBuf::from("/tmp/p0.jpg"));
        assert_eq!(
            item.download_phase(FailureMode::BestEffort),
            DownloadPhase::Failed { pages: vec![1] }
        );
    }

    #[test]
    fn test_phase_without_manifest_never_waits() {
        let item = item_with_pages(&[]);
        assert_eq!(
            item.download_phase(FailureMode::BestEffort),
            DownloadPhase::Failed { pages: vec![] }
        );
    }

    #[test]
    fn test_output_name_falls_back_to_id() {
        let mut item = item_with_pages(&[PageStatus::Queued]);
        assert_eq!(item.output_name(), "Codex 1");
        item.display_name = Some("   ".to_string());
        assert_eq!(item.output_name(), "item_1");
    }

    #[test]
    fn test_library_key_normalized() {
        let mut item = item_with_pages(&[]);
        assert_eq!(item.library_key(), "example");
        item.library = None;
        assert_eq!(item.library_key(), "unknown");
    }

    #[test]
    fn test_failure_mode_parse() {
        assert_eq!("best_effort".parse::<FailureMode>().unwrap(), FailureMode::BestEffort);
        assert!("partial".parse::<FailureMode>().is_err());
        assert_eq!(FailureMode::default(), FailureMode::FailFast);
    }
}
