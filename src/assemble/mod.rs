//! Merging validated pages into output artifacts.
//!
//! Pages are always read in index order from the queue item, never in the
//! order they finished downloading. The page list is cut into parts by
//! [`plan_split`]; every part is written to `<part>.tmp` and renamed into
//! place once complete, so an interrupted run never leaves a half-written
//! artifact under its final name.
//!
//! # Example
//!
//! ```no_run
//! use manuscript_core::assemble::{ArtifactFormat, Assembler, SplitPolicy};
//! # use manuscript_core::queue::QueueItem;
//!
//! # async fn example(item: QueueItem) -> Result<(), Box<dyn std::error::Error>> {
//! let assembler = Assembler::new("out", ArtifactFormat::Zip);
//! let parts = assembler
//!     .assemble(item, SplitPolicy::default().with_max_pages(200))
//!     .await?;
//! println!("{} artifact(s)", parts.len());
//! # Ok(())
//! # }
//! ```

mod error;
mod split;
mod writer;

pub use error::AssemblyError;
pub use split::{SplitPolicy, plan_split};
pub use writer::{
    ArtifactFormat, ArtifactWriter, ConcatArtifactWriter, PartPage, ZipArtifactWriter,
};

use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::queue::{PageStatus, QueueItem};

/// Path separators, control characters and characters Windows rejects.
#[allow(clippy::expect_used)]
static UNSAFE_NAME_CHARS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"[/\\:*?"<>|\x00-\x1F\x7F]+"#).expect("name regex is valid")
});

#[allow(clippy::expect_used)]
static WHITESPACE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace regex is valid"));

/// Fallback when a name sanitizes to nothing.
const FALLBACK_NAME: &str = "manuscript";

/// Maximum sanitized name length in characters.
const MAX_NAME_CHARS: usize = 120;

/// Writes the artifacts of completed items.
#[derive(Debug, Clone)]
pub struct Assembler {
    output_dir: PathBuf,
    format: ArtifactFormat,
}

impl Assembler {
    /// Creates an assembler writing into `output_dir`.
    #[must_use]
    pub fn new(output_dir: impl Into<PathBuf>, format: ArtifactFormat) -> Self {
        Self {
            output_dir: output_dir.into(),
            format,
        }
    }

    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    #[must_use]
    pub fn format(&self) -> ArtifactFormat {
        self.format
    }

    /// Assembles `item` on the blocking thread pool.
    ///
    /// # Errors
    ///
    /// See [`Self::assemble_blocking`]; a panicked task becomes
    /// [`AssemblyError::Join`].
    #[instrument(skip(self, item), fields(item_id = item.id, pages = item.pages.len()))]
    pub async fn assemble(
        &self,
        item: QueueItem,
        split: SplitPolicy,
    ) -> Result<Vec<PathBuf>, AssemblyError> {
        let assembler = self.clone();
        tokio::task::spawn_blocking(move || assembler.assemble_blocking(&item, &split))
            .await
            .map_err(|e| AssemblyError::Join(e.to_string()))?
    }

    /// Writes every part of `item` and returns their paths in part order.
    ///
    /// On failure every part written by this call is removed again.
    ///
    /// # Errors
    ///
    /// - [`AssemblyError::Empty`] if the item has no pages
    /// - [`AssemblyError::PageNotReady`] if a page is not validated
    /// - [`AssemblyError::Io`] / [`AssemblyError::Zip`] on write failures
    pub fn assemble_blocking(
        &self,
        item: &QueueItem,
        split: &SplitPolicy,
    ) -> Result<Vec<PathBuf>, AssemblyError> {
        let pages = ready_pages(item)?;
        let sizes: Vec<u64> = pages.iter().map(|(_, size)| *size).collect();
        let parts = plan_split(&sizes, split);

        std::fs::create_dir_all(&self.output_dir)
            .map_err(|e| AssemblyError::io(&self.output_dir, e))?;

        let name = sanitize_name(&item.output_name());
        let writer = self.format.writer();
        let offset = item.page_offset();
        let mut written: Vec<PathBuf> = Vec::with_capacity(parts.len());

        for (part_index, range) in parts.iter().enumerate() {
            let file_name = artifact_file_name(
                &name,
                part_index,
                parts.len(),
                &(range.start + offset..range.end + offset),
                self.format.extension(),
            );
            let destination = self.output_dir.join(file_name);
            let part_pages: Vec<PartPage> = pages[range.clone()]
                .iter()
                .map(|(page, _)| page.clone())
                .collect();

            if let Err(error) = write_part_atomically(writer.as_ref(), &destination, &part_pages) {
                warn!(item_id = item.id, part = part_index + 1, error = %error, "assembly failed, removing partial output");
                for path in &written {
                    let _ = std::fs::remove_file(path);
                }
                return Err(error);
            }

            debug!(
                item_id = item.id,
                part = part_index + 1,
                first_page = range.start + offset + 1,
                last_page = range.end + offset,
                path = %destination.display(),
                "part written"
            );
            written.push(destination);
        }

        info!(item_id = item.id, parts = written.len(), "item assembled");
        Ok(written)
    }
}

/// Validated pages with their sizes, in index order.
///
/// Part pages carry their manifest position, so a ranged item keeps the
/// page numbers of the full manuscript.
fn ready_pages(item: &QueueItem) -> Result<Vec<(PartPage, u64)>, AssemblyError> {
    if item.pages.is_empty() {
        return Err(AssemblyError::Empty);
    }
    let offset = item.page_offset();

    let mut ordered: Vec<_> = item.pages.iter().collect();
    ordered.sort_by_key(|page| page.index);

    ordered
        .into_iter()
        .map(|page| match (&page.local_path, page.status) {
            (Some(path), PageStatus::Validated) => {
                let size = match page.byte_size {
                    Some(size) => size,
                    None => std::fs::metadata(path)
                        .map_err(|e| AssemblyError::io(path, e))?
                        .len(),
                };
                Ok((
                    PartPage {
                        index: page.index + offset,
                        label: page.label.clone(),
                        path: path.clone(),
                    },
                    size,
                ))
            }
            _ => Err(AssemblyError::PageNotReady { index: page.index }),
        })
        .collect()
}

fn write_part_atomically(
    writer: &dyn ArtifactWriter,
    destination: &Path,
    pages: &[PartPage],
) -> Result<(), AssemblyError> {
    let mut temp = destination.as_os_str().to_owned();
    temp.push(".tmp");
    let temp = PathBuf::from(temp);

    let result = writer
        .write_part(&temp, pages)
        .and_then(|_| std::fs::rename(&temp, destination).map_err(|e| AssemblyError::io(destination, e)));
    if result.is_err() {
        let _ = std::fs::remove_file(&temp);
    }
    result
}

/// `<name>.<ext>` for a single part, otherwise
/// `<name>_part_001_pages_1-200.<ext>` with 1-based page numbers.
#[must_use]
pub fn artifact_file_name(
    name: &str,
    part_index: usize,
    part_count: usize,
    pages: &Range<usize>,
    extension: &str,
) -> String {
    if part_count <= 1 {
        format!("{name}.{extension}")
    } else {
        format!(
            "{name}_part_{:03}_pages_{}-{}.{extension}",
            part_index + 1,
            pages.start + 1,
            pages.end
        )
    }
}

/// Makes a display name safe to use as a file name.
#[must_use]
pub fn sanitize_name(name: &str) -> String {
    let replaced = UNSAFE_NAME_CHARS.replace_all(name, "_");
    let collapsed = WHITESPACE_RUN.replace_all(&replaced, " ");
    let trimmed: String = collapsed
        .trim_matches(|c: char| c == '.' || c == '_' || c.is_whitespace())
        .chars()
        .take(MAX_NAME_CHARS)
        .collect();
    let trimmed = trimmed.trim_end();

    if trimmed.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::queue::{ItemState, PageRange, PageRef};
    use tempfile::TempDir;

    fn item_with_files(dir: &Path, contents: &[&[u8]]) -> QueueItem {
        let pages = contents
            .iter()
            .enumerate()
            .map(|(index, bytes)| {
                let path = dir.join(format!("page_{index:04}.jpg"));
                std::fs::write(&path, bytes).unwrap();
                let mut page = PageRef::new(index, format!("https://lib.example/{index}.jpg"), "");
                page.status = PageStatus::Validated;
                page.local_path = Some(path);
                page.byte_size = Some(bytes.len() as u64);
                page
            })
            .collect();
        QueueItem {
            id: 9,
            source_url: "https://lib.example/ms/9".into(),
            canonical_url: "https://lib.example/ms/9".into(),
            library: Some("Example".into()),
            display_name: Some("Codex 9".into()),
            state: ItemState::Assembling,
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

    // ==================== Naming Tests ====================

    #[test]
    fn test_single_part_name() {
        assert_eq!(artifact_file_name("Codex", 0, 1, &(0..10), "zip"), "Codex.zip");
    }

    #[test]
    fn test_multi_part_names_sort_in_part_order() {
        let names: Vec<String> = [0..4, 4..8, 8..10]
            .iter()
            .enumerate()
            .map(|(i, range)| artifact_file_name("Codex", i, 3, range, "zip"))
            .collect();
        assert_eq!(
            names,
            vec![
                "Codex_part_001_pages_1-4.zip",
                "Codex_part_002_pages_5-8.zip",
                "Codex_part_003_pages_9-10.zip",
            ]
        );
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(sorted, names);
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("Psalter / Book   of Hours"), "Psalter _ Book of Hours");
        assert_eq!(sanitize_name("../../etc/passwd"), "etc_passwd");
        assert_eq!(sanitize_name("a:b*c?"), "a_b_c");
        assert_eq!(sanitize_name("\u{0}\u{1}"), "manuscript");
        assert_eq!(sanitize_name(&"x".repeat(300)).len(), MAX_NAME_CHARS);
    }

    // ==================== Assembly Tests ====================

    #[test]
    fn test_concat_preserves_index_order_across_parts() {
        let pages_dir = TempDir::new().unwrap();
        let out_dir = TempDir::new().unwrap();
        let mut item = item_with_files(pages_dir.path(), &[b"00", b"11", b"22", b"33", b"44"]);
        // Fetch order must not matter.
        item.pages.reverse();

        let assembler = Assembler::new(out_dir.path(), ArtifactFormat::Concat);
        let parts = assembler
            .assemble_blocking(&item, &SplitPolicy::default().with_max_pages(2))
            .unwrap();

        assert_eq!(parts.len(), 3);
        let joined: Vec<u8> = parts.iter().flat_map(|p| std::fs::read(p).unwrap()).collect();
        assert_eq!(joined, b"0011223344");
        assert!(parts[0].ends_with("Codex 9_part_001_pages_1-2.bin"));
        assert!(parts[2].ends_with("Codex 9_part_003_pages_5-5.bin"));
    }

    #[test]
    fn test_zip_single_artifact() {
        let pages_dir = TempDir::new().unwrap();
        let out_dir = TempDir::new().unwrap();
        let item = item_with_files(pages_dir.path(), &[b"a", b"b", b"c"]);

        let assembler = Assembler::new(out_dir.path().join("nested"), ArtifactFormat::Zip);
        let parts = assembler
            .assemble_blocking(&item, &SplitPolicy::unlimited())
            .unwrap();

        assert_eq!(parts, vec![out_dir.path().join("nested").join("Codex 9.zip")]);
        let archive = zip::ZipArchive::new(std::fs::File::open(&parts[0]).unwrap()).unwrap();
        assert_eq!(archive.len(), 3);
    }

    #[test]
    fn test_ranged_item_keeps_manifest_page_numbers() {
        let pages_dir = TempDir::new().unwrap();
        let out_dir = TempDir::new().unwrap();
        let mut item = item_with_files(pages_dir.path(), &[b"c", b"d", b"e"]);
        item.page_range = Some(PageRange::new(3, None).unwrap());

        let assembler = Assembler::new(out_dir.path(), ArtifactFormat::Zip);
        let single = assembler
            .assemble_blocking(&item, &SplitPolicy::unlimited())
            .unwrap();
        assert!(single[0].ends_with("Codex 9_pages_3-5.zip"));
        let mut archive = zip::ZipArchive::new(std::fs::File::open(&single[0]).unwrap()).unwrap();
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert_eq!(names, ["0003.jpg", "0004.jpg", "0005.jpg"]);

        let split = Assembler::new(out_dir.path().join("split"), ArtifactFormat::Concat)
            .assemble_blocking(&item, &SplitPolicy::default().with_max_pages(2))
            .unwrap();
        assert!(split[0].ends_with("Codex 9_pages_3-5_part_001_pages_3-4.bin"));
        assert!(split[1].ends_with("Codex 9_pages_3-5_part_002_pages_5-5.bin"));
    }

    #[test]
    fn test_unvalidated_page_rejected() {
        let pages_dir = TempDir::new().unwrap();
        let out_dir = TempDir::new().unwrap();
        let mut item = item_with_files(pages_dir.path(), &[b"a", b"b"]);
        item.pages[1].reset_to_queued();

        let err = Assembler::new(out_dir.path(), ArtifactFormat::Zip)
            .assemble_blocking(&item, &SplitPolicy::unlimited())
            .unwrap_err();
        assert!(matches!(err, AssemblyError::PageNotReady { index: 1 }));
    }

    #[test]
    fn test_failure_removes_written_parts() {
        let pages_dir = TempDir::new().unwrap();
        let out_dir = TempDir::new().unwrap();
        let item = item_with_files(pages_dir.path(), &[b"a", b"b", b"c"]);
        std::fs::remove_file(item.pages[2].local_path.as_ref().unwrap()).unwrap();

        let err = Assembler::new(out_dir.path(), ArtifactFormat::Concat)
            .assemble_blocking(&item, &SplitPolicy::default().with_max_pages(1))
            .unwrap_err();

        assert!(matches!(err, AssemblyError::Io { .. }));
        assert_eq!(std::fs::read_dir(out_dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_assemble_runs_on_blocking_pool() {
        let pages_dir = TempDir::new().unwrap();
        let out_dir = TempDir::new().unwrap();
        let item = item_with_files(pages_dir.path(), &[b"x", b"y"]);

        let parts = Assembler::new(out_dir.path(), ArtifactFormat::Concat)
            .assemble(item, SplitPolicy::unlimited())
            .await
            .unwrap();
        assert_eq!(std::fs::read(&parts[0]).unwrap(), b"xy");
    }
}
