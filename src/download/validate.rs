//! Integrity validation for fetched page payloads.
//!
//! A payload is accepted only when it is at least `min_bytes` long, its
//! declared `Content-Type` does not contradict the expected kind, and its
//! leading bytes carry a known image or PDF signature.

use thiserror::Error;

use crate::queue::ExpectedKind;

/// Minimum size of a valid page payload in bytes.
///
/// Libraries commonly answer missing pages with small placeholder images or
/// HTML error pages; anything below this is rejected.
pub const MIN_PAGE_BYTES: u64 = 1024;

/// Largest page payload buffered in memory before the request is abandoned.
pub const MAX_PAGE_BYTES: u64 = 256 * 1024 * 1024;

/// Detected payload format, used to pick the stored file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Jpeg,
    Png,
    Gif,
    Webp,
    Tiff,
    Jpeg2000,
    Pdf,
    /// Unrecognized bytes, accepted only for [`ExpectedKind::Any`].
    Binary,
}

impl PayloadKind {
    /// File extension used for the stored page.
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Gif => "gif",
            Self::Webp => "webp",
            Self::Tiff => "tif",
            Self::Jpeg2000 => "jp2",
            Self::Pdf => "pdf",
            Self::Binary => "bin",
        }
    }

    /// Returns true for raster image formats.
    #[must_use]
    pub fn is_image(self) -> bool {
        !matches!(self, Self::Pdf | Self::Binary)
    }

    fn satisfies(self, expected: ExpectedKind) -> bool {
        match expected {
            ExpectedKind::Image => self.is_image(),
            ExpectedKind::Pdf => self == Self::Pdf,
            ExpectedKind::Any => true,
        }
    }
}

/// Why a payload was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationFailure {
    /// Payload shorter than the configured minimum.
    #[error("payload too small: {actual} bytes (minimum {min})")]
    TooSmall {
        /// Received size.
        actual: u64,
        /// Configured minimum.
        min: u64,
    },

    /// Payload longer than the configured maximum.
    #[error("payload too large: more than {max} bytes")]
    TooLarge {
        /// Configured maximum.
        max: u64,
    },

    /// Declared content type contradicts the expected kind.
    #[error("unexpected content type '{content_type}' for {expected} page")]
    ContentType {
        /// Declared `Content-Type` header value.
        content_type: String,
        /// Kind the manifest expects.
        expected: ExpectedKind,
    },

    /// Leading bytes do not match any accepted signature.
    #[error("payload signature does not match a {expected} page")]
    Signature {
        /// Kind the manifest expects.
        expected: ExpectedKind,
    },
}

/// Validates page payloads against size, content type and magic bytes.
#[derive(Debug, Clone, Copy)]
pub struct PageValidator {
    min_bytes: u64,
}

impl Default for PageValidator {
    fn default() -> Self {
        Self::new(MIN_PAGE_BYTES)
    }
}

impl PageValidator {
    /// Creates a validator with a custom minimum payload size.
    #[must_use]
    pub fn new(min_bytes: u64) -> Self {
        Self { min_bytes }
    }

    /// Returns the configured minimum payload size.
    #[must_use]
    pub fn min_bytes(&self) -> u64 {
        self.min_bytes
    }

    /// Validates a payload, returning the detected format.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationFailure`] found, checking size, then
    /// content type, then signature.
    pub fn validate(
        &self,
        body: &[u8],
        content_type: Option<&str>,
        expected: ExpectedKind,
    ) -> Result<PayloadKind, ValidationFailure> {
        let actual = body.len() as u64;
        if actual < self.min_bytes {
            return Err(ValidationFailure::TooSmall {
                actual,
                min: self.min_bytes,
            });
        }

        if let Some(raw) = content_type
            && !content_type_allows(raw, expected)
        {
            return Err(ValidationFailure::ContentType {
                content_type: raw.to_string(),
                expected,
            });
        }

        match sniff(body) {
            Some(kind) if kind.satisfies(expected) => Ok(kind),
            None if expected == ExpectedKind::Any => Ok(PayloadKind::Binary),
            _ => Err(ValidationFailure::Signature { expected }),
        }
    }
}

/// Detects the payload format from its leading bytes.
#[must_use]
pub fn sniff(body: &[u8]) -> Option<PayloadKind> {
    const JP2_SIGNATURE: &[u8] = &[
        0x00, 0x00, 0x00, 0x0C, 0x6A, 0x50, 0x20, 0x20, 0x0D, 0x0A, 0x87, 0x0A,
    ];

    if body.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some(PayloadKind::Jpeg)
    } else if body.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        Some(PayloadKind::Png)
    } else if body.starts_with(b"GIF87a") || body.starts_with(b"GIF89a") {
        Some(PayloadKind::Gif)
    } else if body.len() >= 12 && body.starts_with(b"RIFF") && &body[8..12] == b"WEBP" {
        Some(PayloadKind::Webp)
    } else if body.starts_with(b"II*\0") || body.starts_with(b"MM\0*") {
        Some(PayloadKind::Tiff)
    } else if body.starts_with(JP2_SIGNATURE) || body.starts_with(&[0xFF, 0x4F, 0xFF, 0x51]) {
        Some(PayloadKind::Jpeg2000)
    } else if body.starts_with(b"%PDF") {
        Some(PayloadKind::Pdf)
    } else {
        None
    }
}

fn content_type_allows(raw: &str, expected: ExpectedKind) -> bool {
    let media = raw
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    if media.starts_with("text/") || media == "application/json" || media.ends_with("+json") {
        return false;
    }

    match expected {
        ExpectedKind::Image => media != "application/pdf",
        ExpectedKind::Pdf => !media.starts_with("image/"),
        ExpectedKind::Any => true,
    }
}
