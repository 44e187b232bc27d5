//! Assembly error types.

use std::path::PathBuf;

use thiserror::Error;

use crate::failure::ErrorKind;

/// Failure while merging validated pages into artifacts.
///
/// Always [`ErrorKind::Assembly`]: pages stay validated, so a retry only
/// repeats the assembly.
#[derive(Debug, Error)]
pub enum AssemblyError {
    /// Reading a page or writing a part failed.
    #[error("I/O error at {path}: {source}\n  Suggestion: Check free disk space and write permissions")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The archive writer failed.
    #[error("failed to write archive {path}: {source}")]
    Zip {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    /// A page is not validated or has no stored file.
    #[error("page {index} is not ready for assembly")]
    PageNotReady { index: usize },

    /// The item has no pages to assemble.
    #[error("nothing to assemble: item has no pages")]
    Empty,

    /// The blocking assembly task panicked or was aborted.
    #[error("assembly task failed: {0}")]
    Join(String),
}

impl AssemblyError {
    /// Creates an `Io` error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a `Zip` error.
    pub fn zip(path: impl Into<PathBuf>, source: zip::result::ZipError) -> Self {
        Self::Zip {
            path: path.into(),
            source,
        }
    }

    /// Taxonomy kind of every assembly error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Assembly
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_message_has_path_and_suggestion() {
        let err = AssemblyError::io(
            "/out/codex.zip.tmp",
            std::io::Error::new(std::io::ErrorKind::StorageFull, "disk full"),
        );
        let msg = err.to_string();
        assert!(msg.contains("/out/codex.zip.tmp"));
        assert!(msg.contains("disk full"));
        assert!(msg.contains("Suggestion"));
        assert_eq!(err.kind(), ErrorKind::Assembly);
    }

    #[test]
    fn test_page_not_ready_names_page() {
        let err = AssemblyError::PageNotReady { index: 3 };
        assert!(err.to_string().contains("page 3"));
    }
}
