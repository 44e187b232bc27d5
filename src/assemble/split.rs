//! Auto-split planning.
//!
//! [`plan_split`] depends only on the page sizes and the thresholds, so the
//! artifact boundaries of any item can be reconstructed after the fact.

use std::ops::Range;

/// Thresholds bounding a single artifact. `None` or zero means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SplitPolicy {
    pub max_pages: Option<usize>,
    pub max_bytes: Option<u64>,
}

impl SplitPolicy {
    /// No splitting at all.
    #[must_use]
    pub fn unlimited() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = Some(max_pages);
        self
    }

    #[must_use]
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }

    /// Replaces the byte threshold when `max_bytes` is set.
    #[must_use]
    pub fn override_bytes(self, max_bytes: Option<u64>) -> Self {
        match max_bytes {
            Some(max_bytes) => self.with_max_bytes(max_bytes),
            None => self,
        }
    }

    fn page_limit(&self) -> Option<usize> {
        self.max_pages.filter(|limit| *limit > 0)
    }

    fn byte_limit(&self) -> Option<u64> {
        self.max_bytes.filter(|limit| *limit > 0)
    }
}

/// Splits pages (given by size, in index order) into contiguous parts.
///
/// A page joins the current part unless the part already has pages and
/// adding this one would exceed either threshold. A page larger than the
/// byte threshold therefore ends up alone in its own part.
#[must_use]
pub fn plan_split(sizes: &[u64], policy: &SplitPolicy) -> Vec<Range<usize>> {
    let page_limit = policy.page_limit();
    let byte_limit = policy.byte_limit();

    let mut parts = Vec::new();
    let mut start = 0;
    let mut part_bytes = 0_u64;

    for (index, size) in sizes.iter().copied().enumerate() {
        let part_pages = index - start;
        let over_pages = page_limit.is_some_and(|limit| part_pages + 1 > limit);
        let over_bytes = byte_limit.is_some_and(|limit| part_bytes.saturating_add(size) > limit);

        if part_pages > 0 && (over_pages || over_bytes) {
            parts.push(start..index);
            start = index;
            part_bytes = 0;
        }
        part_bytes = part_bytes.saturating_add(size);
    }

    if start < sizes.len() {
        parts.push(start..sizes.len());
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(parts: &[Range<usize>]) -> Vec<usize> {
        parts.iter().map(|part| part.len()).collect()
    }

    #[test]
    fn test_unlimited_is_single_part() {
        let parts = plan_split(&[10, 20, 30], &SplitPolicy::unlimited());
        assert_eq!(parts, vec![0..3]);
    }

    #[test]
    fn test_empty_input_has_no_parts() {
        assert!(plan_split(&[], &SplitPolicy::default().with_max_pages(4)).is_empty());
    }

    #[test]
    fn test_page_threshold_ten_by_four() {
        let parts = plan_split(&[100; 10], &SplitPolicy::default().with_max_pages(4));
        assert_eq!(parts, vec![0..4, 4..8, 8..10]);
        assert_eq!(counts(&parts), vec![4, 4, 2]);
    }

    #[test]
    fn test_byte_threshold() {
        let parts = plan_split(&[40, 40, 40, 10, 90], &SplitPolicy::default().with_max_bytes(100));
        assert_eq!(parts, vec![0..2, 2..4, 4..5]);
    }

    #[test]
    fn test_exact_fit_does_not_split() {
        let parts = plan_split(&[50, 50, 50], &SplitPolicy::default().with_max_bytes(100));
        assert_eq!(parts, vec![0..2, 2..3]);
    }

    #[test]
    fn test_oversized_page_stands_alone() {
        let parts = plan_split(&[10, 500, 10], &SplitPolicy::default().with_max_bytes(100));
        assert_eq!(parts, vec![0..1, 1..2, 2..3]);
    }

    #[test]
    fn test_first_threshold_hit_wins() {
        let policy = SplitPolicy::default().with_max_pages(3).with_max_bytes(100);
        let parts = plan_split(&[60, 30, 5, 5, 5, 5], &policy);
        assert_eq!(parts, vec![0..3, 3..6]);

        let parts = plan_split(&[60, 50, 5], &policy);
        assert_eq!(parts, vec![0..1, 1..3]);
    }

    #[test]
    fn test_zero_thresholds_mean_unlimited() {
        let policy = SplitPolicy::default().with_max_pages(0).with_max_bytes(0);
        assert_eq!(plan_split(&[1, 2, 3], &policy), vec![0..3]);
    }

    #[test]
    fn test_library_override_replaces_byte_threshold() {
        let policy = SplitPolicy::default().with_max_bytes(1_000).override_bytes(Some(100));
        assert_eq!(policy.max_bytes, Some(100));
        assert_eq!(policy.override_bytes(None).max_bytes, Some(100));
    }

    #[test]
    fn test_parts_cover_every_page_once() {
        let sizes: Vec<u64> = (1..=37).map(|n| (n * 7919) % 113).collect();
        let policy = SplitPolicy::default().with_max_pages(5).with_max_bytes(250);
        let parts = plan_split(&sizes, &policy);

        let mut next = 0;
        for part in &parts {
            assert_eq!(part.start, next);
            assert!(!part.is_empty());
            next = part.end;
        }
        assert_eq!(next, sizes.len());
        assert_eq!(plan_split(&sizes, &policy), parts);
    }
}
