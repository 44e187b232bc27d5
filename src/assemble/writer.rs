//! Artifact writers.
//!
//! A writer receives the pages of one part in index order and produces one
//! file at the given destination. The caller owns temp-file naming and the
//! final rename.

use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::trace;
use zip::CompressionMethod;
use zip::ZipWriter;
use zip::write::FileOptions;

use super::error::AssemblyError;

/// One validated page handed to a writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartPage {
    /// 0-based position in the manifest.
    pub index: usize,
    pub label: String,
    /// Stored page file.
    pub path: PathBuf,
}

/// Output container format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ArtifactFormat {
    /// Uncompressed zip archive, one entry per page.
    #[default]
    Zip,
    /// Raw concatenation of page bytes.
    Concat,
}

impl ArtifactFormat {
    /// Returns the configuration string representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::Concat => "concat",
        }
    }

    /// File extension of produced artifacts.
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::Concat => "bin",
        }
    }

    /// Writer implementing this format.
    #[must_use]
    pub fn writer(self) -> Box<dyn ArtifactWriter> {
        match self {
            Self::Zip => Box::new(ZipArtifactWriter),
            Self::Concat => Box::new(ConcatArtifactWriter),
        }
    }
}

impl fmt::Display for ArtifactFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "zip" => Ok(Self::Zip),
            "concat" => Ok(Self::Concat),
            _ => Err(format!("invalid artifact format: {s}")),
        }
    }
}

/// Writes one part.
pub trait ArtifactWriter: Send + Sync {
    /// Writes `pages` (in the given order) to `destination`; returns bytes
    /// of page payload written.
    ///
    /// # Errors
    ///
    /// Returns [`AssemblyError`] if a page cannot be read or the output
    /// cannot be written.
    fn write_part(&self, destination: &Path, pages: &[PartPage]) -> Result<u64, AssemblyError>;
}

/// Stored (uncompressed) zip with entries `0001_<label>.<ext>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZipArtifactWriter;

impl ArtifactWriter for ZipArtifactWriter {
    fn write_part(&self, destination: &Path, pages: &[PartPage]) -> Result<u64, AssemblyError> {
        let file = File::create(destination).map_err(|e| AssemblyError::io(destination, e))?;
        let mut zip = ZipWriter::new(BufWriter::new(file));
        let options = FileOptions::default().compression_method(CompressionMethod::Stored);

        let mut written = 0_u64;
        for page in pages {
            let name = entry_name(page);
            trace!(entry = %name, "adding page");
            zip.start_file(name, options)
                .map_err(|e| AssemblyError::zip(destination, e))?;
            let mut source = File::open(&page.path).map_err(|e| AssemblyError::io(&page.path, e))?;
            written += io::copy(&mut source, &mut zip).map_err(|e| AssemblyError::io(&page.path, e))?;
        }

        let mut out = zip.finish().map_err(|e| AssemblyError::zip(destination, e))?;
        out.flush().map_err(|e| AssemblyError::io(destination, e))?;
        out.get_ref()
            .sync_all()
            .map_err(|e| AssemblyError::io(destination, e))?;
        Ok(written)
    }
}

/// Page bytes back to back, in order.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConcatArtifactWriter;

impl ArtifactWriter for ConcatArtifactWriter {
    fn write_part(&self, destination: &Path, pages: &[PartPage]) -> Result<u64, AssemblyError> {
        let file = File::create(destination).map_err(|e| AssemblyError::io(destination, e))?;
        let mut out = BufWriter::new(file);

        let mut written = 0_u64;
        for page in pages {
            let mut source = File::open(&page.path).map_err(|e| AssemblyError::io(&page.path, e))?;
            written += io::copy(&mut source, &mut out).map_err(|e| AssemblyError::io(&page.path, e))?;
        }

        out.flush().map_err(|e| AssemblyError::io(destination, e))?;
        out.get_ref()
            .sync_all()
            .map_err(|e| AssemblyError::io(destination, e))?;
        Ok(written)
    }
}

/// `0001_f1r.jpg`: 1-based position, sanitized label, stored extension.
fn entry_name(page: &PartPage) -> String {
    let extension = page
        .path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("bin");
    let label: String = page
        .label
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect();
    let label = label.trim_matches(['_', '.']);

    if label.is_empty() {
        format!("{:04}.{extension}", page.index + 1)
    } else {
        format!("{:04}_{label}.{extension}", page.index + 1)
    }
}
