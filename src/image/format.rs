//! Source and output format classification.
//!
//! A [`Format`] can be inferred three ways, cheapest first:
//!
//! - from a filename or object key extension ([`Format::infer_from_path`])
//! - from a declared media type ([`Format::from_media_type`])
//! - from the leading bytes of the content ([`Format::from_magic_bytes`])
//!
//! [`Format::Unknown`] is an ordinary value. Nothing in this module fails.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of leading bytes needed by [`Format::from_magic_bytes`].
pub const MAGIC_BYTES_LENGTH: usize = 32;

/// Image format classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Jpeg,
    Png,
    Tiff,
    Gif,
    Jp2,
    Pdf,
    Webp,
    Unknown,
}

impl Format {
    /// Every known format, `Unknown` excluded.
    pub const ALL: [Format; 7] = [
        Format::Jpeg,
        Format::Png,
        Format::Tiff,
        Format::Gif,
        Format::Jp2,
        Format::Pdf,
        Format::Webp,
    ];

    /// Short stable key, also used for serialization.
    pub const fn key(&self) -> &'static str {
        match self {
            Format::Jpeg => "jpeg",
            Format::Png => "png",
            Format::Tiff => "tiff",
            Format::Gif => "gif",
            Format::Jp2 => "jp2",
            Format::Pdf => "pdf",
            Format::Webp => "webp",
            Format::Unknown => "unknown",
        }
    }

    /// Human-readable name.
    pub const fn name(&self) -> &'static str {
        match self {
            Format::Jpeg => "JPEG",
            Format::Png => "PNG",
            Format::Tiff => "TIFF",
            Format::Gif => "GIF",
            Format::Jp2 => "JPEG2000",
            Format::Pdf => "PDF",
            Format::Webp => "WebP",
            Format::Unknown => "Unknown",
        }
    }

    /// Media types in order of preference.
    pub const fn media_types(&self) -> &'static [&'static str] {
        match self {
            Format::Jpeg => &["image/jpeg", "image/jpg", "image/pjpeg"],
            Format::Png => &["image/png"],
            Format::Tiff => &["image/tiff", "image/tif"],
            Format::Gif => &["image/gif"],
            Format::Jp2 => &["image/jp2", "image/jpx", "image/jpm"],
            Format::Pdf => &["application/pdf"],
            Format::Webp => &["image/webp"],
            Format::Unknown => &["unknown/unknown"],
        }
    }

    /// Filename extensions in order of preference, lowercase, without dot.
    pub const fn extensions(&self) -> &'static [&'static str] {
        match self {
            Format::Jpeg => &["jpg", "jpeg", "jpe", "jif", "jfif"],
            Format::Png => &["png"],
            Format::Tiff => &["tif", "tiff", "ptif", "tf8", "btf"],
            Format::Gif => &["gif"],
            Format::Jp2 => &["jp2", "j2k", "jpx", "jpf", "jpm", "j2c"],
            Format::Pdf => &["pdf"],
            Format::Webp => &["webp"],
            Format::Unknown => &["unknown"],
        }
    }

    pub fn preferred_media_type(&self) -> &'static str {
        self.media_types()[0]
    }

    pub fn preferred_extension(&self) -> &'static str {
        self.extensions()[0]
    }

    pub const fn is_raster(&self) -> bool {
        !matches!(self, Format::Pdf | Format::Unknown)
    }

    pub const fn supports_transparency(&self) -> bool {
        matches!(self, Format::Png | Format::Tiff | Format::Gif | Format::Jp2 | Format::Webp)
    }

    pub const fn is_unknown(&self) -> bool {
        matches!(self, Format::Unknown)
    }

    /// Look a format up by its key or any of its extensions.
    pub fn from_key(key: &str) -> Option<Format> {
        let key = key.trim_start_matches('.').to_ascii_lowercase();
        Format::ALL
            .into_iter()
            .find(|f| f.key() == key || f.extensions().contains(&key.as_str()))
    }

    /// Infer a format from the extension of a path, key or identifier.
    ///
    /// Only the text after the last `.` is considered, and a leading dot
    /// (as in `.hidden`) does not count as an extension.
    pub fn infer_from_path(pathname: &str) -> Format {
        let name = pathname.rsplit(|c| c == '/' || c == '\\').next().unwrap_or(pathname);
        match name.rfind('.') {
            Some(i) if i > 0 => {
                let ext = name[i + 1..].to_ascii_lowercase();
                Format::ALL
                    .into_iter()
                    .find(|f| f.extensions().contains(&ext.as_str()))
                    .unwrap_or(Format::Unknown)
            }
            _ => Format::Unknown,
        }
    }

    /// Map a media type (parameters allowed) to a format.
    ///
    /// Generic types such as `application/octet-stream` map to `Unknown`.
    pub fn from_media_type(media_type: &str) -> Format {
        let essence = media_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        if essence.is_empty() {
            return Format::Unknown;
        }
        Format::ALL
            .into_iter()
            .find(|f| f.media_types().contains(&essence.as_str()))
            .unwrap_or(Format::Unknown)
    }

    /// Detect a format from file signature bytes.
    ///
    /// Needs at most [`MAGIC_BYTES_LENGTH`] bytes; shorter input is fine but
    /// may not be conclusive.
    pub fn from_magic_bytes(bytes: &[u8]) -> Format {
        const JP2_SIGNATURE: [u8; 12] = [
            0x00, 0x00, 0x00, 0x0C, 0x6A, 0x50, 0x20, 0x20, 0x0D, 0x0A, 0x87, 0x0A,
        ];
        const J2K_CODESTREAM: [u8; 4] = [0xFF, 0x4F, 0xFF, 0x51];

        if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Format::Jpeg
        } else if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
            Format::Png
        } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
            Format::Gif
        } else if is_tiff_signature(bytes) {
            Format::Tiff
        } else if bytes.starts_with(&JP2_SIGNATURE) || bytes.starts_with(&J2K_CODESTREAM) {
            Format::Jp2
        } else if bytes.starts_with(b"%PDF") {
            Format::Pdf
        } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
            Format::Webp
        } else {
            Format::Unknown
        }
    }
}

/// Classic TIFF (version 42) or BigTIFF (version 43), either byte order.
fn is_tiff_signature(bytes: &[u8]) -> bool {
    if bytes.len() < 4 {
        return false;
    }
    matches!(
        (bytes[0], bytes[1], bytes[2], bytes[3]),
        (b'I', b'I', 0x2A | 0x2B, 0x00) | (b'M', b'M', 0x00, 0x2A | 0x2B)
    )
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.preferred_extension())
    }
}
